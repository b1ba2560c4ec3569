use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

mod catalog;
mod cli;
mod config;
mod embed;
mod index;
mod lock;
mod recommend;
mod rerank;
#[cfg(test)]
mod tests;
mod web;

use catalog::Gender;
use config::Config;
use embed::{
    EmbedderChain, ImageEmbedder, LocalImageEmbedder, LocalTextEmbedder, RemoteTextEmbedder,
};
use index::{GenerationStorage, IndexStore};
use recommend::{Filters, Recommender, RecommenderOptions, SearchRequest};
use rerank::{CrossEncoderReranker, Reranker};

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::load_with(&args.data_dir);

    match args.command {
        cli::Command::Build { input, batch_size } => build_index(&config, &input, batch_size),

        cli::Command::Daemon {} => {
            let (recommender, storage, space_id) = make_recommender(&config)?;
            web::start_daemon(recommender, storage, space_id, &config);
            Ok(())
        }

        cli::Command::Search {
            query,
            image,
            top_k,
            rerank,
            gender,
            min_price,
            max_price,
            min_rating,
        } => {
            let gender = gender
                .map(|g| g.parse::<Gender>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let query_image = image
                .map(|path| {
                    std::fs::read(&path)
                        .with_context(|| format!("cannot read image {}", path.display()))
                })
                .transpose()?;

            let (recommender, _, _) = make_recommender(&config)?;

            let request = SearchRequest {
                query_text: query,
                query_image,
                top_k,
                rerank,
                filters: Filters {
                    gender,
                    min_price,
                    max_price,
                    min_rating,
                },
            };

            let recommendation = recommender.recommend(&request)?;
            let items: Vec<serde_json::Value> = recommendation
                .results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "rank": r.rank,
                        "score": r.score,
                        "id": r.product.id,
                        "title": r.product.title,
                        "price": r.product.price,
                        "rating": r.product.rating,
                        "gender": r.product.gender,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }
    }
}

/// Build the text embedding chain: the remote provider in front of the
/// local model when configured and preferred, otherwise local only.
fn text_chain(config: &Config) -> anyhow::Result<EmbedderChain> {
    let local = Box::new(LocalTextEmbedder::new(
        &config.embedding.text_model,
        config.cache_dir(),
    )?);

    let chain = match &config.embedding.remote {
        Some(remote) if config.embedding.prefer_remote => {
            let api_key = std::env::var(&remote.api_key_env).unwrap_or_default();
            if api_key.is_empty() {
                log::warn!(
                    "environment variable {} is empty, remote embedding requests may be rejected",
                    remote.api_key_env
                );
            }
            let primary = Box::new(RemoteTextEmbedder::new(
                &remote.endpoint,
                &remote.model,
                &api_key,
                remote.dimensions,
                Duration::from_secs(remote.timeout_secs),
                remote.max_retries,
            )?);
            EmbedderChain::new(primary, Some(local))?
        }
        _ => EmbedderChain::new(local, None)?,
    };
    Ok(chain)
}

fn image_embedder(config: &Config) -> Option<Box<dyn ImageEmbedder>> {
    let model = config.embedding.image_model.trim();
    if model.is_empty() {
        return None;
    }
    match LocalImageEmbedder::new(model, config.cache_dir()) {
        Ok(embedder) => Some(Box::new(embedder)),
        Err(err) => {
            log::warn!("image embedder unavailable, image queries disabled: {err}");
            None
        }
    }
}

/// The cross-encoder is optional: when it cannot be loaded the service
/// keeps running with vector-search ordering only.
fn reranker(config: &Config) -> Option<Box<dyn Reranker>> {
    if !config.rerank.enabled {
        return None;
    }
    match CrossEncoderReranker::new(&config.rerank.model, config.cache_dir()) {
        Ok(reranker) => Some(Box::new(reranker)),
        Err(err) => {
            log::warn!("reranker unavailable, falling back to vector-search order: {err}");
            None
        }
    }
}

fn make_recommender(
    config: &Config,
) -> anyhow::Result<(Arc<Recommender>, GenerationStorage, [u8; 32])> {
    let chain = text_chain(config)?;
    let space_id = chain.space_id_hash();

    let storage = GenerationStorage::new(config.index_dir());
    if !storage.exists() {
        bail!(
            "no index found in {}; run `vogue build <catalog>` first",
            config.index_dir().display()
        );
    }

    let store = Arc::new(IndexStore::new());
    let generation = store.load_from(&storage, &space_id)?;
    log::info!(
        "loaded index generation: {} products, built {}",
        generation.len(),
        generation.built_at()
    );

    let opts = RecommenderOptions {
        default_top_k: config.search.default_top_k,
        max_top_k: config.search.max_top_k,
        rerank_factor: config.search.rerank_factor,
        filter_factor: config.search.filter_factor,
        text_weight: config.search.text_weight,
    };

    let recommender = Arc::new(Recommender::new(
        store,
        chain,
        image_embedder(config),
        reranker(config),
        opts,
    ));
    Ok((recommender, storage, space_id))
}

fn build_index(config: &Config, input: &Path, batch_size: usize) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.base_path())?;
    let _lock = lock::FileLock::try_acquire(Path::new(config.base_path()))
        .context("another build is running")?;

    let records = catalog::load_raw_records(input)?;
    if records.is_empty() {
        bail!("catalog file {} contains no records", input.display());
    }
    let products = catalog::normalize_all(&records);
    log::info!("normalized {} products", products.len());

    let chain = text_chain(config)?;
    let documents: Vec<String> = products.iter().map(|p| p.document_text()).collect();
    let documents = embed::preprocess::prepare_all(&documents);

    let mut vectors = Vec::with_capacity(documents.len());
    for batch in documents.chunks(batch_size.max(1)) {
        vectors.extend(chain.embed_text(batch)?);
        log::info!("embedded {}/{} documents", vectors.len(), documents.len());
    }

    let generation = index::build(products, vectors)?;
    let storage = GenerationStorage::new(config.index_dir());
    storage.save(&generation)?;

    println!(
        "indexed {} products ({}d, space '{}') into {}",
        generation.len(),
        generation.dimension(),
        generation.space(),
        config.index_dir().display()
    );
    Ok(())
}
