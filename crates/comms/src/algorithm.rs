use crate::holder::ClientHolder;

/// Decides how listeners of the same priority level share polls.
pub trait ListenerPriorityAlgorithm: Send + Sync {
    /// Relative weight of a client at recalculation time. Zero or negative
    /// weights still get the minimum share.
    fn weight(&self, holder: &ClientHolder) -> f64;

    /// Payloads to request from `holder` when `available` slots are free.
    /// The result is clamped to `1..=available`.
    fn batch_size(&self, holder: &ClientHolder, available: usize) -> usize;
}

/// Weighs the client's own weighting by queue depth, recent error rate and
/// how often it has come back empty.
#[derive(Debug, Clone)]
pub struct DefaultPriorityAlgorithm {
    pub max_batch: usize,
}

impl DefaultPriorityAlgorithm {
    pub fn new(max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
        }
    }
}

impl Default for DefaultPriorityAlgorithm {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ListenerPriorityAlgorithm for DefaultPriorityAlgorithm {
    fn weight(&self, holder: &ClientHolder) -> f64 {
        let client = holder.client();
        let base = client.weighting().max(0.0);
        let depth = client
            .depth()
            .map_or(1.0, |d| 1.0 + (d as f64 + 1.0).log10());
        // Failing clients stay in rotation at a tenth of their weight.
        let health = 1.0 - 0.9 * holder.error_rate().clamp(0.0, 1.0);
        let idle = 1.0 / (1.0 + 0.25 * f64::from(holder.empty_streak().min(8)));
        base * depth * health * idle
    }

    fn batch_size(&self, holder: &ClientHolder, available: usize) -> usize {
        match holder.client().depth() {
            Some(depth) => (depth as usize).clamp(1, self.max_batch).min(available),
            None => self.max_batch.min(available),
        }
    }
}
