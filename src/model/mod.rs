pub mod architecture;
pub mod checkpoint;
pub mod loss;
pub mod sparsemax;

use crate::error::SimsError;
use architecture::SequentialAttentionNetwork;
use burn::prelude::*;

/// Sequential attention network hyperparameters
#[derive(Config, Debug)]
pub struct NetworkConfig {
    /// Number of input features (schema length)
    pub input_dim: usize,

    /// Number of output classes
    pub output_dim: usize,

    /// Width of the decision representation
    #[config(default = "8")]
    pub n_d: usize,

    /// Width of the attention representation
    #[config(default = "8")]
    pub n_a: usize,

    /// Number of decision steps
    #[config(default = "3")]
    pub n_steps: usize,

    /// Feature reuse relaxation (gamma); 1.0 means each gene is used at most once
    #[config(default = "1.3")]
    pub relaxation: f64,

    /// Step-specific GLU layers per feature transformer
    #[config(default = "2")]
    pub n_independent: usize,

    /// GLU layers shared by every feature transformer
    #[config(default = "2")]
    pub n_shared: usize,

    /// Added inside the mask entropy log
    #[config(default = "1e-15")]
    pub epsilon: f64,

    /// Batch norm running statistics momentum
    #[config(default = "0.02")]
    pub momentum: f64,

    /// Weight of the mask sparsity term in the loss
    #[config(default = "1e-3")]
    pub lambda_sparse: f64,
}

impl NetworkConfig {
    /// Check bounds before any parameter is allocated
    pub fn validate(&self) -> crate::error::Result<()> {
        let fail = |msg: String| Err(SimsError::InvalidArchitecture(msg));

        if self.n_steps < 1 {
            return fail(format!("n_steps must be at least 1, got {}", self.n_steps));
        }
        if self.n_d == 0 || self.n_a == 0 {
            return fail(format!("n_d and n_a must be positive, got n_d={} n_a={}", self.n_d, self.n_a));
        }
        if self.input_dim == 0 {
            return fail("input_dim must be positive".to_string());
        }
        if self.output_dim == 0 {
            return fail("output_dim must be positive".to_string());
        }
        if !self.relaxation.is_finite() || self.relaxation < 1.0 {
            return fail(format!("relaxation must be finite and >= 1, got {}", self.relaxation));
        }
        if self.n_shared + self.n_independent == 0 {
            return fail("feature transformer needs at least one GLU layer".to_string());
        }
        if !(self.momentum > 0.0 && self.momentum < 1.0) {
            return fail(format!("momentum must be in (0, 1), got {}", self.momentum));
        }
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return fail(format!("epsilon must be finite and non-negative, got {}", self.epsilon));
        }
        if !(self.lambda_sparse.is_finite() && self.lambda_sparse >= 0.0) {
            return fail(format!("lambda_sparse must be finite and non-negative, got {}", self.lambda_sparse));
        }
        Ok(())
    }

    /// Validate and build the network
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<SequentialAttentionNetwork<B>> {
        self.validate()?;
        Ok(SequentialAttentionNetwork::new(self, device))
    }
}

/// Flatten a tensor into host memory
pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Index of the largest value in each row; ties go to the lowest index
pub fn argmax_rows(values: &[f32], n_cols: usize) -> Vec<usize> {
    values
        .chunks(n_cols.max(1))
        .map(|row| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate().skip(1) {
                if v > row[best] {
                    best = i;
                }
            }
            best
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::new(100, 5);
        assert_eq!(config.n_d, 8);
        assert_eq!(config.n_a, 8);
        assert_eq!(config.n_steps, 3);
        assert_eq!(config.relaxation, 1.3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_architecture() {
        let bad = [
            NetworkConfig::new(10, 2).with_n_steps(0),
            NetworkConfig::new(10, 2).with_n_d(0),
            NetworkConfig::new(10, 2).with_n_a(0),
            NetworkConfig::new(0, 2),
            NetworkConfig::new(10, 0),
            NetworkConfig::new(10, 2).with_relaxation(0.5),
            NetworkConfig::new(10, 2).with_n_shared(0).with_n_independent(0),
            NetworkConfig::new(10, 2).with_momentum(1.5),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SimsError::InvalidArchitecture(_))));
        }
    }

    #[test]
    fn test_argmax_ties_go_to_lowest_index() {
        let values = [0.2, 0.4, 0.4, 0.5, 0.5, 0.0, 1.0, 1.0, 1.0];
        assert_eq!(argmax_rows(&values, 3), vec![1, 0, 0]);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = NetworkConfig::new(42, 3).with_n_steps(5);
        let json = serde_json::to_string(&config).unwrap();
        let back: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.input_dim, 42);
        assert_eq!(back.n_steps, 5);
    }
}
