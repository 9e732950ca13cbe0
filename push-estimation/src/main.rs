use burn::backend::{wgpu::AutoGraphicsApi, Autodiff, Wgpu};
use burn::grad_clipping::GradientClippingConfig;
use burn::optim::AdamConfig;
use clap::{command, Args, Parser, Subcommand};
use fern::colors::{Color, ColoredLevelConfig};
use particle_filter::{
    FilterModelConfig, MultimodalMeasurementConfig, ResidualDynamicsConfig,
};
use push_estimation::train::{
    evaluate, train_dynamics, train_dynamics_recurrent, train_e2e, train_measurement,
    E2eOptions, EvalOptions, ExperimentConfig, LossKind,
};
use push_estimation::{dataset, CONTROL_DIM, LINEAR_DIMS, STATE_DIM};

const ARTIFACT_DIR: &str = "/tmp/push_estimation";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct BlackoutArgs {
    /// First timestep of a simulated sensor blackout.
    #[arg(long)]
    blackout_start: Option<usize>,
    /// Number of blacked-out timesteps.
    #[arg(long, default_value_t = 4)]
    blackout_len: usize,
}

impl BlackoutArgs {
    fn steps(&self) -> Vec<usize> {
        match self.blackout_start {
            Some(start) => (start..start + self.blackout_len).collect(),
            None => vec![],
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate pushing trajectories into data.sqlite.
    Gen {
        train_len: usize,
        test_len: usize,
    },
    /// Pretrain the dynamics model on single-step transitions.
    TrainDynamics,
    /// Pretrain the dynamics model on full-sequence rollouts.
    TrainDynamicsRecurrent,
    /// Pretrain the measurement model on perturbed-state scoring.
    TrainMeasurement,
    /// Train both models end-to-end through the filter.
    TrainE2e {
        #[arg(long, value_enum, default_value = "gmm")]
        loss: LossKind,
        /// Detach the belief every this many steps instead of
        /// backpropagating through the whole trajectory.
        #[arg(long)]
        truncate: Option<usize>,
        #[command(flatten)]
        blackout: BlackoutArgs,
    },
    /// Roll the trained filter over the test split and report RMSE.
    Rollout {
        #[arg(long, default_value_t = 100)]
        particles: usize,
        /// Spread the initial particles over the whole workspace.
        #[arg(long)]
        uninformed_init: bool,
        #[command(flatten)]
        blackout: BlackoutArgs,
    },
}

type MyBackend = Wgpu<AutoGraphicsApi, f32, i32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

fn init_logger() -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .warn(Color::Yellow)
        .error(Color::Red)
        .trace(Color::BrightBlack);
    fern::Dispatch::new()
        .level(log::LevelFilter::Info)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                colors.color(record.level()),
                record.target(),
                message
            ));
        })
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn experiment_config() -> ExperimentConfig {
    ExperimentConfig::new(
        FilterModelConfig::new(
            ResidualDynamicsConfig::new(STATE_DIM, CONTROL_DIM, LINEAR_DIMS),
            MultimodalMeasurementConfig::new(STATE_DIM),
        ),
        AdamConfig::new().with_grad_clipping(Some(GradientClippingConfig::Value(0.25))),
    )
}

fn main() -> anyhow::Result<()> {
    init_logger()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Gen {
            train_len,
            test_len,
        } => {
            dataset::create_dataset(train_len, "train")?;
            dataset::create_dataset(test_len, "test")?;
        }
        Commands::TrainDynamics => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            train_dynamics::<MyAutodiffBackend>(ARTIFACT_DIR, experiment_config(), device)?;
        }
        Commands::TrainDynamicsRecurrent => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            train_dynamics_recurrent::<MyAutodiffBackend>(
                ARTIFACT_DIR,
                experiment_config(),
                device,
            )?;
        }
        Commands::TrainMeasurement => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            train_measurement::<MyAutodiffBackend>(ARTIFACT_DIR, experiment_config(), device)?;
        }
        Commands::TrainE2e {
            loss,
            truncate,
            blackout,
        } => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            train_e2e::<MyAutodiffBackend>(
                ARTIFACT_DIR,
                experiment_config(),
                device,
                E2eOptions {
                    loss,
                    truncate,
                    blackout: blackout.steps(),
                },
            )?;
        }
        Commands::Rollout {
            particles,
            uninformed_init,
            blackout,
        } => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            evaluate::<MyBackend>(
                ARTIFACT_DIR,
                experiment_config(),
                device,
                EvalOptions {
                    particle_count: particles,
                    uninformed_init,
                    blackout: blackout.steps(),
                },
            )?;
        }
    }
    Ok(())
}
