#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::io::{BufWriter, Write};
use std::process;

use fairpost::data::{load_fit_data, load_prediction_data};
use fairpost::estimate::{FitConfig, fit_policy};
use fairpost::frontier::Constraint;
use fairpost::metrics::{DisparityReport, group_rates};
use fairpost::objective::Objective;
use fairpost::policy::Policy;
use fairpost::types::TieRule;

#[derive(Args)]
pub struct FitArgs {
    /// Path to a TSV file with score, label and group columns
    pub data: String,

    /// Fairness constraint: equalized_odds, demographic_parity,
    /// true_positive_rate_parity or false_positive_rate_parity
    #[arg(long, default_value = "equalized_odds")]
    pub constraint: String,

    /// Objective to maximize: balanced_accuracy, accuracy, true_positive_rate,
    /// true_negative_rate or selection_rate
    #[arg(long, default_value = "balanced_accuracy")]
    pub objective: String,

    /// How a score equal to a threshold is decided: strictly_above or at_or_above
    #[arg(long, default_value = "strictly_above")]
    pub tie_rule: String,

    /// Abort if the constraint frontier needs more vertices than this
    #[arg(long, value_name = "N")]
    pub max_frontier_vertices: Option<usize>,

    /// Group ids the data must contain exactly (repeatable)
    #[arg(long = "expect-group", value_name = "GROUP")]
    pub expected_groups: Vec<String>,

    /// Where to write the fitted policy
    #[arg(long, default_value = "policy.toml")]
    pub output: String,
}

#[derive(Args)]
pub struct InferArgs {
    /// Path to a TSV file with score and group columns (sample_id optional)
    pub data: String,

    /// Path to a fitted policy file (.toml)
    #[arg(long)]
    pub policy: String,

    /// Seed for the randomized rules; omit for a fresh seed on every run
    #[arg(long)]
    pub seed: Option<u64>,

    /// Where to write the decisions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: String,
}

#[derive(Args)]
pub struct ReportArgs {
    /// Path to a labeled TSV file with score, label and group columns
    pub data: String,

    /// Path to a fitted policy file (.toml)
    #[arg(long)]
    pub policy: String,

    /// Also draw one set of decisions with this seed and report their disparities
    #[arg(long)]
    pub seed: Option<u64>,
}

pub fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = FitConfig {
        constraint: args.constraint.parse::<Constraint>()?,
        objective: args.objective.parse::<Objective>()?,
        tie_rule: args.tie_rule.parse::<TieRule>()?,
        max_frontier_vertices: args.max_frontier_vertices,
        expected_groups: args.expected_groups,
        ..FitConfig::default()
    };
    config.validate()?;

    println!("Loading fitting data from: {}", args.data);
    let data = load_fit_data(&args.data)?;
    println!("Loaded {} samples", data.len());

    println!(
        "Fitting {} policy maximizing {}...",
        config.constraint, config.objective
    );
    let policy = fit_policy(&data, &config)?;
    let summary = policy.summary();
    println!(
        "Best {} = {:.6} at frontier coordinate {:.6}",
        config.objective, summary.objective_value, summary.frontier_coordinate
    );
    for (group, rule) in policy.rules() {
        let rates = &summary.groups[group];
        println!(
            "  {group}: threshold_lo={} threshold_hi={} p={:.4} ignore={:.4} | fpr={:.4} tpr={:.4} selection={:.4}",
            rule.threshold_lo,
            rule.threshold_hi,
            rule.mix_probability,
            rule.ignore_probability,
            rates.expected_fpr,
            rates.expected_tpr,
            rates.expected_selection_rate
        );
    }
    for (group, degeneracy) in summary.degenerate_groups() {
        println!("  Warning: group '{group}' is degenerate ({degeneracy})");
    }

    policy.save(&args.output)?;
    println!("Policy saved to: {}", args.output);
    Ok(())
}

pub fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading policy from: {}", args.policy);
    let policy = Policy::load(&args.policy)?;

    println!("Loading data from: {}", args.data);
    let data = load_prediction_data(&args.data)?;
    println!("Loaded {} samples for prediction", data.scores.len());

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let decisions = policy.predict_many(data.scores.view(), &data.groups, &mut rng);

    let mut file = BufWriter::new(fs::File::create(&args.output)?);
    writeln!(file, "sample_id\tgroup\tscore\tselection_probability\tprediction")?;
    let mut unknown = 0usize;
    for (i, decision) in decisions.iter().enumerate() {
        let group = &data.groups[i];
        let score = data.scores[i];
        match (decision, policy.selection_probability(score, group)) {
            (Ok(selected), Ok(probability)) => writeln!(
                file,
                "{}\t{}\t{}\t{}\t{}",
                data.sample_ids[i],
                group,
                score,
                probability,
                u8::from(*selected)
            )?,
            _ => {
                unknown += 1;
                writeln!(file, "{}\t{}\t{}\tNA\tNA", data.sample_ids[i], group, score)?;
            }
        }
    }
    file.flush()?;

    if unknown > 0 {
        println!(
            "Warning: {unknown} samples belong to groups the policy was not fitted on; their predictions are NA"
        );
    }
    println!("Predictions saved to: {}", args.output);
    Ok(())
}

pub fn report(args: ReportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let policy = Policy::load(&args.policy)?;
    let data = load_fit_data(&args.data)?;

    println!("Expected disparities ({}):", policy.config().constraint);
    print_report(&policy.expected_report(&data)?);

    if let Some(seed) = args.seed {
        let mut rng = StdRng::seed_from_u64(seed);
        let decisions = policy
            .predict_many(data.scores.view(), &data.groups, &mut rng)
            .into_iter()
            .map(|d| d.map(|selected| f64::from(u8::from(selected))))
            .collect::<Result<ndarray::Array1<f64>, _>>()?;
        let rates = group_rates(decisions.view(), data.labels.view(), &data.groups)?;
        println!("Realized disparities (seed {seed}):");
        print_report(&DisparityReport::from_rates(rates));
    }
    Ok(())
}

fn print_report(report: &DisparityReport) {
    println!(
        "  selection rate difference: {:.6}",
        report.selection_rate_difference
    );
    println!(
        "  true positive rate difference: {:.6}",
        report.true_positive_rate_difference
    );
    println!(
        "  false positive rate difference: {:.6}",
        report.false_positive_rate_difference
    );
    println!(
        "  equalized odds difference: {:.6}",
        report.equalized_odds_difference()
    );
    for (group, rates) in &report.by_group {
        let flag = rates
            .degeneracy
            .map(|d| format!(" ({d})"))
            .unwrap_or_default();
        println!(
            "  {group}: n={} selection={:.4} tpr={:.4} fpr={:.4}{flag}",
            rates.samples, rates.selection_rate, rates.true_positive_rate, rates.false_positive_rate
        );
    }
}

#[derive(Parser)]
#[command(
    name = "fairpost",
    about = "Fairness-constrained post-processing of classifier scores",
    long_about = "Fits per-group, possibly randomized, threshold rules that maximize an accuracy \
                 objective subject to equalized odds or demographic parity, and applies them."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a post-processing policy from labeled scores
    #[command(about = "Fit a fairness-constrained policy (outputs: policy.toml)")]
    Fit(FitArgs),

    /// Apply a fitted policy to new scores
    #[command(about = "Apply a fitted policy to new data (outputs: predictions.tsv)")]
    Infer(InferArgs),

    /// Report the disparities of a fitted policy on labeled data
    #[command(about = "Report group disparities of a fitted policy")]
    Report(ReportArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Infer(args)) => infer(args),
        Some(Commands::Report(args)) => report(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
