//! Optimizers for training
//!
//! AdamW over the LoRA variables, gradient accumulation and clipping, and
//! warmup learning-rate schedules.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::optim::{Optimizer, ParamsAdamW};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Beta1 (first moment decay)
    pub beta1: f64,
    /// Beta2 (second moment decay)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW optimizer wrapper
pub struct AdamW {
    inner: candle_nn::optim::AdamW,
    vars: Vec<Var>,
    config: AdamWConfig,
    step_count: usize,
}

impl AdamW {
    /// Create a new AdamW optimizer over every variable in `var_map`
    pub fn new(var_map: &VarMap, config: AdamWConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };

        let vars = var_map.all_vars();
        let inner = candle_nn::optim::AdamW::new(vars.clone(), params)?;

        Ok(Self {
            inner,
            vars,
            config,
            step_count: 0,
        })
    }

    /// Perform an optimization step
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner.step(grads)?;
        self.step_count += 1;
        Ok(())
    }

    /// Clip gradients to `max_norm` (global L2) and step.
    ///
    /// Returns the norm before clipping. `max_norm <= 0` disables clipping.
    pub fn step_with_clipping(&mut self, grads: &mut GradStore, max_norm: f64) -> Result<f64> {
        let total_norm = compute_grad_norm(grads, &self.vars)?;

        if max_norm > 0.0 && total_norm > max_norm {
            let clip_coef = max_norm / (total_norm + 1e-6);
            tracing::debug!(
                "Gradient norm {:.4} > max_norm {:.4}, clipping with coef {:.4}",
                total_norm,
                max_norm,
                clip_coef
            );
            for var in &self.vars {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    let clipped = (grad * clip_coef)?;
                    grads.insert(var.as_tensor(), clipped);
                }
            }
        }

        self.step(grads)?;
        Ok(total_norm)
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
        self.inner.set_learning_rate(lr);
    }

    /// Get step count
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Variables being optimized
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }
}

/// Sums gradients over micro-batches until an optimizer step
pub struct GradAccumulator {
    vars: Vec<Var>,
    sums: Vec<Option<Tensor>>,
    micro_batches: usize,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        let sums = vec![None; vars.len()];
        Self {
            vars,
            sums,
            micro_batches: 0,
        }
    }

    /// Add one micro-batch worth of gradients
    pub fn accumulate(&mut self, grads: &GradStore) -> Result<()> {
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *sum = Some(match sum.take() {
                    Some(acc) => (acc + grad)?,
                    None => grad.clone(),
                });
            }
        }
        self.micro_batches += 1;
        Ok(())
    }

    /// Micro-batches since the last drain
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn is_empty(&self) -> bool {
        self.micro_batches == 0
    }

    /// Replace the variable gradients in `store` with the sums and reset
    pub fn drain_into(&mut self, store: &mut GradStore) {
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            match sum.take() {
                Some(total) => {
                    store.insert(var.as_tensor(), total);
                }
                None => {
                    store.remove(var.as_tensor());
                }
            }
        }
        self.micro_batches = 0;
    }
}

/// Learning-rate schedule shape after warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Cosine,
    Linear,
    Constant,
}

impl std::str::FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "constant" | "constant_with_warmup" => Ok(Self::Constant),
            _ => Err(anyhow::anyhow!(
                "Invalid scheduler: {}. Valid options: cosine, linear, constant",
                s
            )),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::Linear => write!(f, "linear"),
            Self::Constant => write!(f, "constant"),
        }
    }
}

/// Learning rate scheduler
pub struct LearningRateScheduler {
    kind: SchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler with warmup and cosine decay
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self::with_kind(SchedulerKind::Cosine, base_lr, warmup_steps, total_steps)
    }

    pub fn with_kind(kind: SchedulerKind, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Warmup length for a ratio of the total steps
    pub fn warmup_steps_for(total_steps: usize, warmup_ratio: f64) -> usize {
        (total_steps as f64 * warmup_ratio).ceil() as usize
    }

    /// Get the learning rate for the current step
    pub fn get_lr(&self) -> f64 {
        let step = self.current_step;
        if step < self.warmup_steps {
            // Linear warmup
            return self.base_lr * (step as f64 / self.warmup_steps.max(1) as f64);
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = ((step - self.warmup_steps) as f64 / decay_steps).min(1.0);
        let factor = match self.kind {
            SchedulerKind::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
            SchedulerKind::Linear => 1.0 - progress,
            SchedulerKind::Constant => 1.0,
        };
        self.base_lr * factor.max(0.0)
    }

    /// Step the scheduler and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    /// Reset the scheduler
    pub fn reset(&mut self) {
        self.current_step = 0;
    }

    /// Get current step
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }
}

/// Compute the global L2 norm of the gradients of `params`
pub fn compute_grad_norm(grads: &GradStore, params: &[Var]) -> Result<f64> {
    let mut total_norm_sq: f64 = 0.0;

    for param in params {
        if let Some(grad) = grads.get(param.as_tensor()) {
            let grad_norm_sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
            total_norm_sq += grad_norm_sq as f64;
        }
    }

    Ok(total_norm_sq.sqrt())
}
