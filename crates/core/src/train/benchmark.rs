//! Timed training loop.

use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

use candle_core::{DType, Device};
use candle_nn::{Optimizer, SGD};

use super::data::SyntheticBatch;
use super::error::Result;
use super::grad_sync::GradSync;
use crate::distributed::ParallelEnv;
use crate::dtype::DataType;
use crate::model::ExampleModel;
use crate::moe::{MoeLayer, ParamKind};

/// Loop parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkSettings {
    pub num_steps: usize,
    pub learning_rate: f64,
    /// Weight of the load-balancing loss added to the NLL loss.
    pub l_aux_wt: f64,
    /// Number of trailing steps averaged in the summary.
    pub summary_window: usize,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            num_steps: 100,
            learning_rate: 1e-5,
            l_aux_wt: 0.0,
            summary_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: usize,
    pub loss: f32,
    pub step_time: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub steps: Vec<StepRecord>,
    /// Mean step time over the summary window, in seconds.
    pub average_step_time: f64,
}

/// Run configuration echoed before training starts.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkHeader {
    pub world_size: usize,
    pub dtype: DataType,
    pub model_dim: usize,
    pub hidden_size: usize,
    pub samples: usize,
    pub num_local_experts: usize,
    pub top_k: usize,
    pub device: String,
    pub group_count: usize,
}

impl fmt::Display for BenchmarkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Benchmark] world_size = {}, dtype = {}, model_dim = {}, hidden_size = {}, \
             samples = {}, num_local_experts = {}, topK = {}, device = `{}`, group_count = {}",
            self.world_size,
            self.dtype,
            self.model_dim,
            self.hidden_size,
            self.samples,
            self.num_local_experts,
            self.top_k,
            self.device,
            self.group_count,
        )
    }
}

/// `Device-{rank}: data_rank = {}, model_rank = {}`
pub fn device_banner(env: &ParallelEnv) -> String {
    format!(
        "Device-{}: data_rank = {}, model_rank = {}",
        env.global_rank, env.data_rank, env.model_rank
    )
}

/// Parameter counts of the two classes, followed by a blank line.
pub fn statistics_line(moe: &MoeLayer) -> String {
    format!(
        "[Statistics] param count for MoE local_experts = {}, param count for MoE gate = {}.\n",
        moe.param_count(ParamKind::LocalExperts),
        moe.param_count(ParamKind::Gate),
    )
}

pub struct Benchmark<'a> {
    model: &'a ExampleModel,
    batch: SyntheticBatch,
    grad_sync: GradSync,
    optimizer: SGD,
    settings: BenchmarkSettings,
    device: Device,
    is_coordinator: bool,
}

impl<'a> Benchmark<'a> {
    pub fn new(
        model: &'a ExampleModel,
        env: &ParallelEnv,
        batch: SyntheticBatch,
        settings: BenchmarkSettings,
    ) -> Result<Self> {
        let params = model.moe_layer().all_parameters();
        let grad_sync = GradSync::new(&params, env);
        let optimizer = SGD::new(
            params.into_iter().map(|p| p.var).collect(),
            settings.learning_rate,
        )?;
        Ok(Self {
            model,
            batch,
            grad_sync,
            optimizer,
            settings,
            device: env.local_device.clone(),
            is_coordinator: env.is_coordinator(),
        })
    }

    /// One synchronized training step.
    pub fn step(&mut self, step: usize) -> Result<StepRecord> {
        self.device.synchronize()?;
        let start = Instant::now();

        let out = self.model.forward(&self.batch.x)?;
        let mut loss = candle_nn::loss::nll(&out.log_probs, &self.batch.y)?;
        if self.settings.l_aux_wt != 0.0 {
            let l_aux = out.l_aux.to_dtype(loss.dtype())?;
            loss = (loss + l_aux.affine(self.settings.l_aux_wt, 0.0)?)?;
        }
        let mut grads = loss.backward()?;
        self.grad_sync.synchronize(&mut grads)?;
        self.optimizer.step(&grads)?;

        self.device.synchronize()?;
        let step_time = start.elapsed();
        let loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        tracing::debug!(step, loss, step_time_ms = step_time.as_millis() as u64, "step done");
        Ok(StepRecord {
            step,
            loss,
            step_time,
        })
    }

    /// Run every step, writing per-step and summary lines to `out` on the
    /// coordinator only.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<BenchmarkReport> {
        let mut steps = Vec::with_capacity(self.settings.num_steps);
        for i in 0..self.settings.num_steps {
            let record = self.step(i)?;
            if self.is_coordinator {
                writeln!(
                    out,
                    "STEP-{}: DONE, loss = {}, step_time = {} sec.",
                    record.step,
                    record.loss,
                    record.step_time.as_secs_f64()
                )?;
            }
            steps.push(record);
        }

        let average_step_time = trailing_mean(&steps, self.settings.summary_window);
        if self.is_coordinator {
            writeln!(
                out,
                "\n[Summary] Average synchronized step_time = {average_step_time} sec."
            )?;
            out.flush()?;
        }
        Ok(BenchmarkReport {
            steps,
            average_step_time,
        })
    }
}

/// Mean step time in seconds over the last `window` steps (fewer if the run
/// was shorter). Zero for an empty run.
pub fn trailing_mean(steps: &[StepRecord], window: usize) -> f64 {
    let n = window.min(steps.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = steps[steps.len() - n..]
        .iter()
        .map(|s| s.step_time.as_secs_f64())
        .sum();
    total / n as f64
}
