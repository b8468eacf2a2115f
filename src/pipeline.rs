use std::path::PathBuf;

use ndarray::{Array2, Array3, Array4};
use tracing::{info, instrument};

use crate::{
    config::{DeepStockConfig, MarketDataConfig},
    data::{
        align::{align, AlignedBatch},
        chart::ChartRasterizer,
        images::ImageLoader,
        market::{CsvSource, MarketDataSource, RawSeries, YahooFinanceSource},
        sentiment::{HeadlineSentimentSource, SentimentScorer, SentimentSource},
        window::{MinMaxScaler, WindowSeries},
    },
    error::DeepStockError,
    model::{fusion::HybridModel, persistence::save_model},
    training::{
        split::train_test_split,
        trainer::{Evaluation, Trainer, TrainingHistory},
    },
};

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub samples: usize,
    pub history: TrainingHistory,
    pub evaluation: Evaluation,
    pub model_path: PathBuf,
}

/// Runs the full pipeline with the collaborators named in `config`.
#[instrument(skip(config), fields(ticker = %config.ticker))]
pub async fn run(config: &DeepStockConfig) -> Result<RunSummary, DeepStockError> {
    config.validate()?;
    let sentiment = HeadlineSentimentSource::new(&config.fetch)?;
    match &config.market_data {
        MarketDataConfig::Yahoo => {
            let market = YahooFinanceSource::new(&config.fetch)?;
            run_with_sources(config, &market, sentiment).await
        }
        MarketDataConfig::Csv { path } => {
            let market = CsvSource::new(path);
            run_with_sources(config, &market, sentiment).await
        }
    }
}

/**
Fetch, build every modality, align, split, train, evaluate and persist.

Rendering and training run on the blocking pool while the sources are async.

## Arguments
* `config` - The run configuration.
* `market` - Supplies the raw close series.
* `sentiment` - Supplies the news sentiment scalar.

## Returns
A [`RunSummary`] once the model has been written to `model-path`.
 */
#[instrument(skip_all)]
pub async fn run_with_sources<M, S>(
    config: &DeepStockConfig,
    market: &M,
    sentiment: S,
) -> Result<RunSummary, DeepStockError>
where
    M: MarketDataSource,
    S: SentimentSource,
{
    let series = market
        .fetch(&config.ticker, config.start_date()?, config.end_date()?)
        .await?;
    info!("Fetched {} prices for {}", series.len(), config.ticker);

    let (windows, images) = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || build_modalities(&config, &series)).await??
    };
    let mut scorer = SentimentScorer::new(sentiment);
    let sentiments = scorer.score_targets(&config.news_url, windows.len()).await;

    let batch = align(&images, &windows.sequences, &sentiments, &windows.targets)?;
    info!("Aligned {} samples", batch.len());

    let samples = batch.len();

    let (history, evaluation, model) = {
        let config = config.clone();
        let scaler = windows.scaler;
        tokio::task::spawn_blocking(move || train_and_evaluate(&config, &batch, scaler)).await??
    };
    save_model(&config.model_path, &model)?;

    Ok(RunSummary {
        samples,
        history,
        evaluation,
        model_path: config.model_path.clone(),
    })
}

/// Windows the series while its charts are rendered and loaded.
pub fn build_modalities(
    config: &DeepStockConfig,
    series: &RawSeries,
) -> Result<(WindowSeries, Array4<f64>), DeepStockError> {
    let closes = series.closes();
    let rasterizer = ChartRasterizer::new(config.render_size, config.window_size);
    let loader = ImageLoader::new(config.chart_size);

    let (windows, images) = rayon::join(
        || WindowSeries::build(&closes, config.window_size),
        || -> Result<Array4<f64>, DeepStockError> {
            rasterizer.render_all(series, &config.chart_dir)?;
            loader.load_dir(&config.chart_dir)
        },
    );
    Ok((windows?, images?))
}

/// Splits `batch`, fits a fresh model and scores it on the held-out part.
#[instrument(skip_all, fields(samples = batch.len()))]
pub fn train_and_evaluate(
    config: &DeepStockConfig,
    batch: &AlignedBatch,
    scaler: MinMaxScaler,
) -> Result<(TrainingHistory, Evaluation, HybridModel), DeepStockError> {
    let training = &config.training;
    let split = train_test_split(batch, training.test_size, training.random_state)?;

    let mut model = HybridModel::new(
        &config.model,
        config.chart_size,
        config.window_size,
        training.random_state,
    )?;
    model.set_scaler(scaler);

    let mut trainer = Trainer::new(training);
    let history = trainer.fit(&mut model, &split.train)?;
    let evaluation = trainer.evaluate(&model, &split.test)?;
    Ok((history, evaluation, model))
}

/// Predicts closes in price units using the scaler stored with the model.
pub fn predict_prices(
    model: &HybridModel,
    images: &Array4<f64>,
    sequences: &Array3<f64>,
    sentiments: &Array2<f64>,
) -> Result<Vec<f64>, DeepStockError> {
    let scaler = model.scaler().ok_or_else(|| {
        DeepStockError::ConfigError("model has no stored price scaler".to_string())
    })?;
    let scaled = model.predict(images, sequences, sentiments)?;
    Ok(scaler.inverse_transform_vec(&scaled.to_vec()))
}
