//! Validation metrics used as search objectives.

/// Indices of `scores` ordered best-first; ties keep input order.
pub fn rank_order(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

fn dcg(labels: impl Iterator<Item = f64>) -> f64 {
    labels
        .enumerate()
        .map(|(i, rel)| (2f64.powf(rel) - 1.0) / ((i + 2) as f64).log2())
        .sum()
}

/// Mean NDCG@k over groups. Groups whose ideal DCG is zero are skipped.
pub fn ndcg_at(scores: &[f64], labels: &[f64], groups: &[usize], k: usize) -> f64 {
    let mut total = 0.0;
    let mut counted = 0usize;
    let mut start = 0usize;

    for &size in groups {
        let end = (start + size).min(scores.len());
        let group_scores = &scores[start..end];
        let group_labels = &labels[start..end];
        start = end;

        let mut ideal: Vec<f64> = group_labels.to_vec();
        ideal.sort_by(|a, b| b.total_cmp(a));
        let idcg = dcg(ideal.into_iter().take(k));
        if idcg <= 0.0 {
            continue;
        }
        let actual = dcg(
            rank_order(group_scores)
                .into_iter()
                .take(k)
                .map(|i| group_labels[i]),
        );
        total += actual / idcg;
        counted += 1;
    }

    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

/// Area under the ROC curve with average ranks for tied scores.
/// Degenerate inputs with one class score 0.5.
pub fn auc(scores: &[f64], labels: &[f64]) -> f64 {
    let positives = labels.iter().filter(|&&l| l > 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 share their average
        let avg_rank = (i + j + 2) as f64 / 2.0;
        for &idx in &order[i..=j] {
            if labels[idx] > 0.5 {
                positive_rank_sum += avg_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}
