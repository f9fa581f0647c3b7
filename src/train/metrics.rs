//! Loss aggregation and retrieval metrics for evaluation passes.

use candle_core::Tensor;

/// Running mean over pushed loss values.
#[derive(Debug, Default)]
pub(crate) struct LossMeter {
    sum: f64,
    count: usize,
}

impl LossMeter {
    pub(crate) fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Fraction of rows whose matching column ranks inside the top `k`.
///
/// The rank of the match is the number of strictly better entries in its
/// row, so ties never push a match out of the cutoff.
pub(crate) fn recall_at_k(scores: &Tensor, k: usize) -> candle_core::Result<f64> {
    let rows = scores.to_vec2::<f32>()?;
    if rows.is_empty() {
        return Ok(0.0);
    }
    let mut hits = 0usize;
    for (i, row) in rows.iter().enumerate() {
        let target = row[i];
        let better = row.iter().filter(|&&score| score > target).count();
        if better < k {
            hits += 1;
        }
    }
    Ok(hits as f64 / rows.len() as f64)
}

/// One evaluation pass over the validation split.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub epoch: usize,
    pub step: u64,
    pub clips: usize,
    pub mean_loss: f64,
    pub recall_at_1: f64,
    pub recall_at_10: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn loss_meter_reports_the_running_mean() {
        let mut meter = LossMeter::default();
        assert_eq!(meter.mean(), 0.0);
        meter.push(1.0);
        meter.push(2.0);
        assert!((meter.mean() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn recall_counts_rows_whose_match_ranks_in_the_top_k() {
        // Rows 0 and 1 rank their match first; row 2 ranks it second.
        let scores = Tensor::from_vec(
            vec![0.9f32, 0.1, 0.2, 0.0, 0.8, 0.3, 0.1, 0.7, 0.5],
            (3, 3),
            &Device::Cpu,
        )
        .expect("build score matrix");
        let at_1 = recall_at_k(&scores, 1).expect("recall@1");
        let at_2 = recall_at_k(&scores, 2).expect("recall@2");
        assert!((at_1 - 2.0 / 3.0).abs() < 1e-12);
        assert!((at_2 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ties_do_not_push_the_match_out_of_the_top_k() {
        let scores =
            Tensor::full(0.5f32, (4, 4), &Device::Cpu).expect("build uniform score matrix");
        let at_1 = recall_at_k(&scores, 1).expect("recall@1");
        assert_eq!(at_1, 1.0);
    }

    #[test]
    fn empty_score_matrix_yields_zero_recall() {
        let scores = Tensor::zeros((0, 0), candle_core::DType::F32, &Device::Cpu)
            .expect("build empty matrix");
        assert_eq!(recall_at_k(&scores, 1).expect("recall@1"), 0.0);
    }
}
