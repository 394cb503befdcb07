use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use cognitive_twin::candle::infer::Predictor;
use cognitive_twin::candle::train::{train, TrainConfig};
use cognitive_twin::constants::{files, train as defaults};
use cognitive_twin::history::report::{read_report, report_path, Report};
use cognitive_twin::types::ForecastResult;
use cognitive_twin::utils::mean;

#[derive(Parser)]
#[command(name = "cognitive_twin")]
#[command(about = "Cognitive score forecasting from voice, handwriting and covariates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Train {
        #[arg(long, default_value = files::DATA_PATH)]
        data_dir: PathBuf,

        #[arg(long, default_value = files::CHECKPOINT_PATH)]
        checkpoint_dir: PathBuf,

        #[arg(long, default_value = files::TRAINING_PATH)]
        training_dir: PathBuf,

        #[arg(short, long, default_value_t = defaults::EPOCHS)]
        epochs: usize,

        #[arg(short, long, default_value_t = defaults::BATCH_SIZE)]
        batch_size: usize,

        #[arg(long, default_value_t = defaults::LEARNING_RATE)]
        lr: f64,

        #[arg(long, default_value_t = defaults::PATIENCE)]
        patience: usize,

        #[arg(long, default_value_t = defaults::SEED)]
        seed: u64,

        /// Refit covariate normalization on the training split
        #[arg(long, default_value_t = false)]
        fit_scalar_stats: bool,
    },
    Infer {
        #[arg(short, long)]
        patient_id: Option<String>,

        #[arg(short, long, default_value_t = false)]
        all: bool,

        #[arg(long, default_value = files::DATA_PATH)]
        data_dir: PathBuf,

        #[arg(long, default_value = files::CHECKPOINT_PATH)]
        checkpoint_dir: PathBuf,

        #[arg(short, long, default_value = "predictions.csv")]
        output: PathBuf,

        /// Scales the predicted decline (1.0 = no change)
        #[arg(short, long, default_value_t = 1.0)]
        decline_factor: f32,
    },
    /// Prints a training curve written by `train`
    Report {
        /// e.g. loss, mae, rmse, val_ordering
        name: String,

        #[arg(long, default_value = files::TRAINING_PATH)]
        training_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("{}", "Start".green());

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Train {
            data_dir,
            checkpoint_dir,
            training_dir,
            epochs,
            batch_size,
            lr,
            patience,
            seed,
            fit_scalar_stats,
        }) => {
            let config = TrainConfig {
                epochs,
                batch_size,
                learning_rate: lr,
                patience,
                seed,
                fit_scalar_stats,
                data_dir,
                checkpoint_dir,
                training_dir,
                ..Default::default()
            };
            let results = train(&config).context("training failed")?;
            println!(
                "{} best epoch {} | test MAE {:.2} | RMSE {:.2} | R² 18m {:.3} 24m {:.3}",
                "Done".green(),
                results.best_epoch,
                results.test.mae,
                results.test.rmse,
                results.test.r2[0],
                results.test.r2[1],
            );
        }
        Some(Commands::Infer {
            patient_id,
            all,
            data_dir,
            checkpoint_dir,
            output,
            decline_factor,
        }) => {
            let predictor = Predictor::from_dirs(&checkpoint_dir, &data_dir)
                .context("failed to set up predictor")?;

            if all {
                let ids = predictor.store().patient_ids();
                let mut results = Vec::with_capacity(ids.len());
                for (id, result) in ids.iter().zip(predictor.predict_all(&ids, decline_factor)?) {
                    match result {
                        Ok(forecast) => {
                            println!("{} {id}", "✓".green());
                            results.push(forecast);
                        }
                        Err(err) => println!("{} {id}: {err}", "✗".red()),
                    }
                }
                predictor.save_predictions(&results, &output)?;
                println!("Saved {} predictions to {}", results.len(), output.display());
                print_summary(&results);
            } else if let Some(patient_id) = patient_id {
                let result = predictor.predict(&patient_id, decline_factor)?;
                print_forecast(&result);
            } else {
                println!("{}", "Pass --patient-id <ID> or --all".yellow());
            }
        }
        Some(Commands::Report { name, training_dir }) => {
            let path = report_path(&training_dir, &name);
            let report = read_report(&path)
                .with_context(|| format!("failed to read report {}", path.display()))?;
            print_report(&report);
        }
        None => {
            println!("{}", "No command given, see --help".yellow());
        }
    }

    println!("{}", "End".green());
    Ok(())
}

fn print_forecast(result: &ForecastResult) {
    println!("{}", format!("Patient {}", result.patient_id).bold());
    for (month, score) in result.historical_months.iter().zip(&result.historical_scores) {
        println!("  month {month:>4.0}: {score:.1}");
    }
    if result.counterfactual_applied {
        println!("  decline factor {:.2}", result.decline_factor);
    }
    for h in 0..result.horizons_months.len() {
        let actual = result
            .actual_scores
            .map(|a| format!(" (actual {:.1})", a[h]))
            .unwrap_or_default();
        println!(
            "  month {:>4.0}: {:.1} [{:.1}, {:.1}]{actual}",
            result.horizons_months[h], result.median[h], result.ci_lower[h], result.ci_upper[h],
        );
    }
}

fn print_summary(results: &[ForecastResult]) {
    let errors: Vec<[f32; 2]> = results.iter().filter_map(ForecastResult::absolute_errors).collect();
    if errors.is_empty() {
        return;
    }
    for (h, label) in ["18-month", "24-month"].iter().enumerate() {
        let abs: Vec<f32> = errors.iter().map(|e| e[h]).collect();
        let sq: Vec<f32> = abs.iter().map(|e| e * e).collect();
        println!("{label}: MAE {:.2} | RMSE {:.2}", mean(&abs), mean(&sq).sqrt());
    }
}

fn print_report(report: &Report) {
    let title = match &report.y_label {
        Some(y_label) => format!("{} ({y_label})", report.title),
        None => report.title.clone(),
    };
    println!("{}", title.bold());
    for line in report.table() {
        println!("{line}");
    }
    for (label, best) in report.minima() {
        match best {
            Some((epoch, value)) => println!("min {label}: {value:.4} at epoch {epoch}"),
            None => println!("min {label}: -"),
        }
    }
}
