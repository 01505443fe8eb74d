//! Optimisers.
//!
//! * `adamw` — candle's `AdamW` (decoupled weight decay).
//! * `adam` — the same `AdamW` with its own decay switched off; decay is
//!   applied as L2 (`g += wd·θ`) before the step instead.
//! * `sgd` — [`MomentumSgd`], heavy-ball or Nesterov momentum with L2 decay.

use candle_core::{backprop::GradStore, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use mmsa_common::{OptimizerKind, TrainConfig};

// ── MomentumSgd ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

/// SGD with momentum:
///
/// ```text
/// d = g + wd·θ
/// b = μ·b + d
/// d = nesterov ? d + μ·b : b
/// θ = θ - lr·d
/// ```
pub struct MomentumSgd {
    vars: Vec<Var>,
    buffers: Vec<Var>,
    params: ParamsSgd,
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars: Vec<Var> = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .collect();
        let buffers = vars
            .iter()
            .map(|v| Var::zeros(v.shape(), v.dtype(), v.device()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            buffers,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
            nesterov,
        } = self.params;
        for (var, buf) in self.vars.iter().zip(self.buffers.iter()) {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let mut d = if weight_decay != 0.0 {
                (g + var.as_tensor().affine(weight_decay, 0.0)?)?
            } else {
                g.clone()
            };
            if momentum != 0.0 {
                let next = (buf.as_tensor().affine(momentum, 0.0)? + &d)?;
                buf.set(&next)?;
                d = if nesterov {
                    (d + next.affine(momentum, 0.0)?)?
                } else {
                    next
                };
            }
            let updated = var.as_tensor().sub(&d.affine(lr, 0.0)?)?;
            var.set(&updated)?;
        }
        Ok(())
    }
}

// ── ParamOptimizer ──────────────────────────────────────────────────────────

/// The optimiser selected by [`TrainConfig::optimizer`].
pub enum ParamOptimizer {
    AdamW(AdamW),
    Adam {
        inner: AdamW,
        vars: Vec<Var>,
        weight_decay: f64,
    },
    Sgd(MomentumSgd),
}

impl ParamOptimizer {
    pub fn from_config(config: &TrainConfig, vars: Vec<Var>) -> Result<Self> {
        let lr = config.learning_rate;
        Ok(match config.optimizer {
            OptimizerKind::AdamW => Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: config.weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Adam => Self::Adam {
                inner: AdamW::new(
                    vars.clone(),
                    ParamsAdamW {
                        lr,
                        weight_decay: 0.0,
                        ..Default::default()
                    },
                )?,
                vars,
                weight_decay: config.weight_decay,
            },
            OptimizerKind::Sgd => Self::Sgd(MomentumSgd::new(
                vars,
                ParamsSgd {
                    lr,
                    momentum: config.momentum,
                    weight_decay: config.weight_decay,
                    nesterov: config.nesterov,
                },
            )?),
        })
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Adam {
                inner,
                vars,
                weight_decay,
            } => {
                if *weight_decay != 0.0 {
                    for var in vars.iter() {
                        if let Some(g) = grads.remove(var.as_tensor()) {
                            let g = (g + var.as_tensor().affine(*weight_decay, 0.0)?)?;
                            grads.insert(var.as_tensor(), g);
                        }
                    }
                }
                inner.step(grads)
            }
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Adam { inner, .. } => inner.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Adam { inner, .. } => inner.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}
