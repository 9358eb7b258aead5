use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::atomic::Ordering;
use towerrec::data::synthetic;
use towerrec::utils::metrics::RecommendationMetrics;
use towerrec::utils::validation::{validate_config, validate_item_features};
use towerrec::{
    init_tracing, Config, Dataset, RecommendationResponse, RecommendationService, TrainingReport, TrainingService,
    TwoTowerModel,
};
use tracing::{info, warn};

const PCA_ITERATIONS: usize = 100;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train shallow and deep two-tower retrieval models side by side", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seed for parameter init, shuffling and the synthetic dataset.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Raw user id to recommend for; defaults to the first active user.
    #[arg(short, long)]
    user: Option<u64>,
}

#[derive(Serialize)]
struct ModelSummary {
    name: &'static str,
    report: TrainingReport,
    recommendations: RecommendationResponse,
    evaluation: RecommendationMetrics,
    /// 2-D PCA coordinates of the first few items.
    projection: Vec<[f32; 2]>,
    explained_variance: [f32; 2],
}

#[derive(Serialize)]
struct RunSummary {
    users: usize,
    items: usize,
    interactions: usize,
    held_out: usize,
    user_id: u64,
    user_top_rated: Vec<String>,
    models: Vec<ModelSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    info!("Starting towerrec trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    apply_overrides(&mut config, &args);
    validate_config(&config).context("Invalid configuration")?;

    info!("Training configuration loaded: {:?}", config.training);

    let (items, ratings) = synthetic::generate(&config.data);
    validate_item_features(&items)?;
    let full = Dataset::from_raw(items, &ratings)?;
    let (train, held_out) = full.leave_last_out(config.training.min_user_interactions);

    let models = vec![
        TwoTowerModel::new(train.num_users(), train.num_items(), config.shallow.clone())?,
        TwoTowerModel::new(train.num_users(), train.num_items(), config.deep.clone())?,
    ];

    let trainer = TrainingService::new(config.training.clone());
    let cancel = trainer.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let (models, reports, train) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut models = models;
        let reports = trainer.fit_all(&mut models, &train)?;
        Ok((models, reports, train))
    })
    .await
    .context("Training task panicked")??;

    let recommender = RecommendationService::new(config.recommendation.clone());
    let top_k = recommender.default_top_k();
    let user = match args.user {
        Some(user_id) => train
            .user_index(user_id)
            .with_context(|| format!("User {} has no ratings", user_id))?,
        None => train
            .active_users(config.training.min_user_interactions)
            .first()
            .copied()
            .context("No active users to recommend for")?,
    };

    let mut summaries = Vec::with_capacity(models.len());
    for (model, report) in models.iter().zip(reports) {
        let name = if model.is_deep() { "deep" } else { "shallow" };
        let recommendations = recommender.recommend(model, &train, user, top_k)?;
        let evaluation = recommender.evaluate(model, &train, &held_out, top_k)?;
        let projection = model.project_items(PCA_ITERATIONS)?;
        let shown = projection.points.nrows().min(top_k);

        summaries.push(ModelSummary {
            name,
            report,
            recommendations,
            evaluation,
            projection: (0..shown).map(|row| projection.point(row)).collect(),
            explained_variance: projection.explained_variance,
        });
    }

    let user_top_rated = train
        .top_rated(user, top_k)
        .into_iter()
        .filter_map(|item| train.item(item).map(|raw| raw.title.clone()))
        .collect();

    let summary = RunSummary {
        users: full.num_users(),
        items: full.num_items(),
        interactions: full.interactions().len(),
        held_out: held_out.len(),
        user_id: train.user_raw_id(user).unwrap_or_default(),
        user_top_rated,
        models: summaries,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Trainer finished");
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(seed) = args.seed {
        config.shallow.seed = Some(seed);
        config.deep.seed = Some(seed.wrapping_add(1));
        config.training.shuffle_seed = Some(seed);
        config.data.seed = seed;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(top_k) = args.top_k {
        config.recommendation.top_k = top_k;
    }
}
