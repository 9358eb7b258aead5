use crate::error::{ModelError, Result};
use nalgebra::DMatrix;

/// Loss value and its gradients w.r.t. the user and item tower outputs.
#[derive(Debug, Clone)]
pub struct InBatchLoss {
    pub loss: f32,
    pub grad_users: DMatrix<f32>,
    pub grad_items: DMatrix<f32>,
}

/// In-batch softmax cross-entropy over `users · itemsᵀ`.
///
/// Row `k` of `items` is the positive for row `k` of `users`; every other row
/// of `items` is a negative for it, including rows that happen to repeat the
/// same item. The cross-entropy is averaged over the batch and
/// `l2 * (‖users‖² + ‖items‖²)` is added when `l2 > 0`.
pub fn in_batch_softmax(users: &DMatrix<f32>, items: &DMatrix<f32>, l2: f32) -> Result<InBatchLoss> {
    let batch = users.nrows();
    if batch == 0 {
        return Err(ModelError::EmptyBatch);
    }
    if items.shape() != users.shape() {
        return Err(ModelError::shape("item tower output", users.shape(), items.shape()));
    }

    let logits = users * items.transpose();
    let mut grad_logits = DMatrix::zeros(batch, batch);
    let mut total = 0.0f32;

    for r in 0..batch {
        let max = (0..batch).fold(f32::NEG_INFINITY, |m, c| m.max(logits[(r, c)]));
        let sum_exp: f32 = (0..batch).map(|c| (logits[(r, c)] - max).exp()).sum();
        let log_sum_exp = max + sum_exp.ln();
        total += log_sum_exp - logits[(r, r)];

        for c in 0..batch {
            let p = (logits[(r, c)] - log_sum_exp).exp();
            let target = if r == c { 1.0 } else { 0.0 };
            grad_logits[(r, c)] = (p - target) / batch as f32;
        }
    }

    let mut loss = total / batch as f32;
    let mut grad_users = &grad_logits * items;
    let mut grad_items = grad_logits.tr_mul(users);

    if l2 > 0.0 {
        loss += l2 * (users.norm_squared() + items.norm_squared());
        grad_users += users * (2.0 * l2);
        grad_items += items * (2.0 * l2);
    }

    Ok(InBatchLoss {
        loss,
        grad_users,
        grad_items,
    })
}
