use crate::error::{Result, SimsError};
use crate::model::sparsemax::sparsemax;
use crate::model::NetworkConfig;
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid, softmax};

/// Batch norm followed by a gated linear unit.
///
/// The linear projection is passed in so that shared layers can live once
/// in the network while every step keeps its own normalisation.
#[derive(Module, Debug)]
pub struct GluLayer<B: Backend> {
    bn: BatchNorm<B, 0>,
    width: usize,
}

impl<B: Backend> GluLayer<B> {
    fn new(width: usize, momentum: f64, device: &B::Device) -> Self {
        Self {
            bn: BatchNormConfig::new(2 * width).with_momentum(momentum).init(device),
            width,
        }
    }

    fn forward(&self, fc: &Linear<B>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = self.bn.forward(fc.forward(x));
        let [n, _] = h.dims();
        let value = h.clone().slice([0..n, 0..self.width]);
        let gate = h.slice([0..n, self.width..2 * self.width]);
        value * sigmoid(gate)
    }
}

/// Stack of GLU layers: shared ones first, then step-specific ones
#[derive(Module, Debug)]
pub struct FeatureTransformer<B: Backend> {
    shared_glu: Vec<GluLayer<B>>,
    independent_fc: Vec<Linear<B>>,
    independent_glu: Vec<GluLayer<B>>,
}

impl<B: Backend> FeatureTransformer<B> {
    fn new(config: &NetworkConfig, device: &B::Device) -> Self {
        let width = config.n_d + config.n_a;
        let shared_glu = (0..config.n_shared)
            .map(|_| GluLayer::new(width, config.momentum, device))
            .collect();
        let independent_fc = (0..config.n_independent)
            .map(|i| {
                let fan_in = if i == 0 && config.n_shared == 0 { config.input_dim } else { width };
                LinearConfig::new(fan_in, 2 * width).with_bias(false).init(device)
            })
            .collect();
        let independent_glu = (0..config.n_independent)
            .map(|_| GluLayer::new(width, config.momentum, device))
            .collect();

        Self {
            shared_glu,
            independent_fc,
            independent_glu,
        }
    }

    fn forward(&self, shared_fc: &[Linear<B>], x: Tensor<B, 2>) -> Tensor<B, 2> {
        let scale = 0.5f64.sqrt();
        let layers = shared_fc
            .iter()
            .zip(&self.shared_glu)
            .chain(self.independent_fc.iter().zip(&self.independent_glu));

        let mut h = x;
        for (i, (fc, glu)) in layers.enumerate() {
            // the first layer changes width, so it has no residual
            h = if i == 0 {
                glu.forward(fc, h)
            } else {
                (h.clone() + glu.forward(fc, h)).mul_scalar(scale)
            };
        }
        h
    }
}

/// Produces one step's sparse feature mask
#[derive(Module, Debug)]
pub struct AttentiveTransformer<B: Backend> {
    fc: Linear<B>,
    bn: BatchNorm<B, 0>,
}

impl<B: Backend> AttentiveTransformer<B> {
    fn new(config: &NetworkConfig, device: &B::Device) -> Self {
        Self {
            fc: LinearConfig::new(config.n_a, config.input_dim)
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(config.input_dim)
                .with_momentum(config.momentum)
                .init(device),
        }
    }

    fn forward(&self, prior: Tensor<B, 2>, attention: Tensor<B, 2>) -> Tensor<B, 2> {
        let scores = self.bn.forward(self.fc.forward(attention));
        sparsemax(scores * prior)
    }
}

/// Logits plus the mask sparsity regulariser
#[derive(Debug, Clone)]
pub struct NetworkOutput<B: Backend> {
    /// Unnormalised class scores, [batch, classes]
    pub logits: Tensor<B, 2>,
    /// Mean over steps of `mean_rows(sum_genes(M * ln(M + eps)))`
    pub sparsity_loss: Tensor<B, 1>,
}

/// Aggregated attributions and the raw per-step masks
#[derive(Debug, Clone)]
pub struct MaskOutput<B: Backend> {
    /// Masks weighted by each step's decision magnitude and summed, [batch, genes]
    pub explain: Tensor<B, 2>,
    /// One [batch, genes] mask per decision step
    pub masks: Vec<Tensor<B, 2>>,
}

struct Trace<B: Backend> {
    decision: Tensor<B, 2>,
    sparsity_loss: Tensor<B, 1>,
    explain: Tensor<B, 2>,
    masks: Vec<Tensor<B, 2>>,
}

/// Multi-step attentive classifier over schema-ordered gene vectors
#[derive(Module, Debug)]
pub struct SequentialAttentionNetwork<B: Backend> {
    initial_bn: BatchNorm<B, 0>,
    shared_fc: Vec<Linear<B>>,
    initial_splitter: FeatureTransformer<B>,
    feature_transformers: Vec<FeatureTransformer<B>>,
    attentive_transformers: Vec<AttentiveTransformer<B>>,
    final_mapping: Linear<B>,
    input_dim: usize,
    output_dim: usize,
    n_d: usize,
    n_a: usize,
    relaxation: f64,
    epsilon: f64,
}

impl<B: Backend> SequentialAttentionNetwork<B> {
    /// Build from an already validated config; see [`NetworkConfig::init`]
    pub(crate) fn new(config: &NetworkConfig, device: &B::Device) -> Self {
        let width = config.n_d + config.n_a;
        let shared_fc = (0..config.n_shared)
            .map(|i| {
                let fan_in = if i == 0 { config.input_dim } else { width };
                LinearConfig::new(fan_in, 2 * width).with_bias(false).init(device)
            })
            .collect();

        Self {
            initial_bn: BatchNormConfig::new(config.input_dim)
                .with_momentum(config.momentum)
                .init(device),
            shared_fc,
            initial_splitter: FeatureTransformer::new(config, device),
            feature_transformers: (0..config.n_steps)
                .map(|_| FeatureTransformer::new(config, device))
                .collect(),
            attentive_transformers: (0..config.n_steps)
                .map(|_| AttentiveTransformer::new(config, device))
                .collect(),
            final_mapping: LinearConfig::new(config.n_d, config.output_dim)
                .with_bias(false)
                .init(device),
            input_dim: config.input_dim,
            output_dim: config.output_dim,
            n_d: config.n_d,
            n_a: config.n_a,
            relaxation: config.relaxation,
            epsilon: config.epsilon,
        }
    }

    /// Expected feature vector length
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Number of classes
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Number of decision steps
    pub fn n_steps(&self) -> usize {
        self.feature_transformers.len()
    }

    fn check_input(&self, x: &Tensor<B, 2>) -> Result<()> {
        let [_, width] = x.dims();
        if width != self.input_dim {
            return Err(SimsError::DimensionMismatch {
                expected: self.input_dim,
                actual: width,
                origin: None,
                row: None,
            });
        }
        Ok(())
    }

    fn run_steps(&self, x: Tensor<B, 2>) -> Trace<B> {
        let device = x.device();
        let [n, genes] = x.dims();
        let (n_d, n_a) = (self.n_d, self.n_a);

        let x = self.initial_bn.forward(x);
        let mut prior = Tensor::<B, 2>::ones([n, genes], &device);
        let mut attention = self
            .initial_splitter
            .forward(&self.shared_fc, x.clone())
            .slice([0..n, n_d..n_d + n_a]);

        let mut decision = Tensor::<B, 2>::zeros([n, n_d], &device);
        let mut explain = Tensor::<B, 2>::zeros([n, genes], &device);
        let mut sparsity_loss = Tensor::<B, 1>::zeros([1], &device);
        let mut masks = Vec::with_capacity(self.n_steps());

        for (attentive, transformer) in self.attentive_transformers.iter().zip(&self.feature_transformers) {
            let mask = attentive.forward(prior.clone(), attention);

            let entropy = mask.clone() * mask.clone().add_scalar(self.epsilon).log();
            sparsity_loss = sparsity_loss + entropy.sum_dim(1).mean();

            // genes used now are discounted later
            prior = mask.clone().neg().add_scalar(self.relaxation) * prior;

            let h = transformer.forward(&self.shared_fc, mask.clone() * x.clone());
            let step_decision = relu(h.clone().slice([0..n, 0..n_d]));

            let step_weight = step_decision.clone().sum_dim(1);
            explain = explain + mask.clone() * step_weight;
            decision = decision + step_decision;

            attention = h.slice([0..n, n_d..n_d + n_a]);
            masks.push(mask);
        }

        Trace {
            decision,
            sparsity_loss: sparsity_loss.div_scalar(self.n_steps() as f64),
            explain,
            masks,
        }
    }

    /// Logits and sparsity regulariser for a [batch, genes] input
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<NetworkOutput<B>> {
        self.check_input(&x)?;
        let trace = self.run_steps(x);
        Ok(NetworkOutput {
            logits: self.final_mapping.forward(trace.decision),
            sparsity_loss: trace.sparsity_loss,
        })
    }

    /// Class probabilities, each row summing to 1
    pub fn probabilities(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        Ok(softmax(self.forward(x)?.logits, 1))
    }

    /// Probabilities together with the aggregated attributions and step masks
    pub fn forward_masks(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, MaskOutput<B>)> {
        self.check_input(&x)?;
        let trace = self.run_steps(x);
        let probs = softmax(self.final_mapping.forward(trace.decision), 1);
        Ok((
            probs,
            MaskOutput {
                explain: trace.explain,
                masks: trace.masks,
            },
        ))
    }
}
