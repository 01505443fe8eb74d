//! Learning-rate schedules, advanced once per optimiser step.

use mmsa_common::{SchedulerKind, TrainConfig};

/// Shape of the schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrSchedule {
    /// Half-cosine from the base LR down to `min_lr` over the whole run.
    Cosine { min_lr: f64 },
    /// Multiply by `gamma` every `step_size` steps.
    Step { step_size: usize, gamma: f64 },
    /// Linear ramp from 0 over `warmup_steps`, then linear decay to 0.
    Linear { warmup_steps: usize },
}

/// Learning-rate schedule over a fixed number of optimiser steps.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    base_lr: f64,
    total_steps: usize,
    schedule: LrSchedule,
}

impl LrScheduler {
    pub fn new(base_lr: f64, total_steps: usize, schedule: LrSchedule) -> Self {
        Self {
            step: 0,
            base_lr,
            total_steps,
            schedule,
        }
    }

    /// Build the schedule a run with `batches_per_epoch` batches needs.
    pub fn from_config(config: &TrainConfig, batches_per_epoch: usize) -> Self {
        let schedule = match config.scheduler {
            SchedulerKind::Cosine => LrSchedule::Cosine {
                min_lr: config.min_lr,
            },
            SchedulerKind::Step => LrSchedule::Step {
                step_size: config.step_size.max(1),
                gamma: config.gamma,
            },
            SchedulerKind::Linear => LrSchedule::Linear {
                warmup_steps: config.warmup_steps(batches_per_epoch),
            },
        };
        Self::new(
            config.learning_rate,
            config.total_steps(batches_per_epoch),
            schedule,
        )
    }

    /// Learning rate at an arbitrary step.
    pub fn lr_at(&self, step: usize) -> f64 {
        let total = self.total_steps;
        match self.schedule {
            LrSchedule::Cosine { min_lr } => {
                if total == 0 {
                    return self.base_lr;
                }
                let progress = step.min(total) as f64 / total as f64;
                let cos = (std::f64::consts::PI * progress).cos();
                min_lr + 0.5 * (self.base_lr - min_lr) * (1.0 + cos)
            }
            LrSchedule::Step { step_size, gamma } => {
                let exponent = (step / step_size.max(1)) as i32;
                self.base_lr * gamma.powi(exponent)
            }
            LrSchedule::Linear { warmup_steps } => {
                if step < warmup_steps {
                    return self.base_lr * step as f64 / warmup_steps.max(1) as f64;
                }
                let decay_steps = total.saturating_sub(warmup_steps).max(1);
                let remaining = total.saturating_sub(step) as f64;
                self.base_lr * (remaining / decay_steps as f64).max(0.0)
            }
        }
    }

    /// Learning rate for the step about to run.
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
