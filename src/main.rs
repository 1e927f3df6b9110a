use mnist_conv::config::{OptimizerKind, TrainingConfig};
use mnist_conv::{run, train};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides applied on top of the config file (or the defaults).
#[derive(Args)]
struct ConfigArgs {
    /// JSON training config; unset fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    train_size: Option<usize>,
    #[arg(long)]
    test_size: Option<usize>,
    #[arg(long)]
    shuffle_buffer: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    test_batch_size: Option<usize>,
    /// Chunk size used while evaluating
    #[arg(long)]
    eval_batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long, value_enum)]
    optimizer: Option<OptimizerKind>,
    #[arg(long)]
    learning_rate: Option<f32>,
    /// Seed for weight init and shuffling
    #[arg(long)]
    seed: Option<u64>,
}

impl ConfigArgs {
    fn resolve(self) -> mnist_conv::Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.train_size {
            config.train_size = v;
        }
        if let Some(v) = self.test_size {
            config.test_size = v;
        }
        if let Some(v) = self.shuffle_buffer {
            config.shuffle_buffer = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.test_batch_size {
            config.test_batch_size = v;
        }
        if let Some(v) = self.eval_batch_size {
            config.eval_batch_size = v;
        }
        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.optimizer {
            config.optimizer = v;
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train the CNN on MNIST, then evaluate it on the test split
    Train {
        #[command(flatten)]
        config: ConfigArgs,
        /// Where to save the trained model
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },
    /// Evaluate a saved model on the test split
    Evaluate {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Run inference on raw 28x28 image files (784 bytes each)
    Predict {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, num_args = 1.., required = true)]
        image_path: Vec<PathBuf>,
    },
}

fn execute(command: Commands) -> mnist_conv::Result<()> {
    match command {
        Commands::Train {
            config,
            checkpoint,
            quiet,
        } => {
            let config = config.resolve()?;
            log::debug!("{config:?}");
            let report = train::train(&config, checkpoint.as_deref(), !quiet)?;
            println!("Test {}", report.test);
        }
        Commands::Evaluate { config, checkpoint } => {
            let metrics = train::evaluate_checkpoint(&config.resolve()?, &checkpoint)?;
            println!("Test {metrics}");
        }
        Commands::Predict {
            checkpoint,
            image_path,
        } => {
            run::run(&checkpoint, &image_path)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = execute(cli.command) {
        log::error!("{e}");
        std::process::exit(1);
    }
}
