//! Demo CLI: extract text from a single PDF or image.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use docpipeline::config::ConversionConfig;
use docpipeline::dependency_probe::{DependencyProbe, ProbeOverrides};
use docpipeline::conversion_gate::ConversionGate;
use docpipeline::metrics::SessionLog;
use docpipeline::ocr::pool::OcrPool;
use docpipeline::ocr::tesseract::TesseractBackend;
use docpipeline::orchestrator::{CancelToken, ExtractOptions, Language, Orchestrator};
use docpipeline::temp_registry::TempRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "docpipeline")]
#[command(about = "Extracts text from a PDF or image, OCRing scanned pages as needed")]
#[command(version)]
struct Cli {
    /// Path to the PDF or image file to extract
    file: PathBuf,

    /// OCR language
    #[arg(short, long, default_value = "eng")]
    language: String,

    /// Cap the number of pages rasterized and OCR'd
    #[arg(long)]
    max_pages: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docpipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ConversionConfig::from_env()?;

    let probe = Arc::new(DependencyProbe::new(ProbeOverrides::default()));
    let temp_registry = Arc::new(TempRegistry::new(
        config.temp_file_max_count,
        config.temp_file_max_age_ms,
        config.temp_file_max_size_bytes,
    ));
    let pool_size = config
        .ocr_pool_size
        .unwrap_or_else(|| num_cpus::get().clamp(1, 2));
    let ocr_pool = Arc::new(OcrPool::new(pool_size, 500, || {
        Arc::new(TesseractBackend::new())
    }));
    let gate = Arc::new(ConversionGate::new(config.max_concurrent));
    let session_log = Arc::new(SessionLog::new());
    let _summary_task = Arc::clone(&session_log).spawn_periodic_summary();

    let orchestrator = Orchestrator::new(
        Arc::clone(&probe),
        config,
        Arc::clone(&temp_registry),
        ocr_pool,
        gate,
        Arc::clone(&session_log),
    );

    let language = match cli.language.as_str() {
        "fra" => Language::Fra,
        _ => Language::Eng,
    };
    let task_id = uuid::Uuid::new_v4().to_string();
    let options = ExtractOptions {
        language,
        max_pages: cli.max_pages,
        summarize: None,
    };

    let result = orchestrator
        .extract(&task_id, &cli.file, options, CancelToken::new())
        .await?;

    let json = serde_json::json!({
        "text": result.text,
        "confidence": result.confidence,
        "summary": result.summary.iter().map(|p| serde_json::json!({
            "pageNumber": p.page_number,
            "pageText": p.page_text,
            "workerId": p.worker_id,
        })).collect::<Vec<_>>(),
        "metadata": {
            "pageCount": result.metadata.page_count,
            "originalPageCount": result.metadata.original_page_count,
            "processedPages": result.metadata.processed_pages,
            "processingTimeMs": result.metadata.processing_time_ms,
            "isScannedPdf": result.metadata.is_scanned_pdf,
            "ocrMethod": result.metadata.ocr_method.as_str(),
            "textDensity": result.metadata.text_density,
            "averageWordsPerPage": result.metadata.average_words_per_page,
            "detectionReason": result.metadata.detection_reason,
            "tempFilesCreated": result.metadata.temp_files_created,
            "conversionSupported": result.metadata.conversion_supported,
            "fallbackUsed": result.metadata.fallback_used,
            "conversionDisabled": result.metadata.conversion_disabled,
        },
    });
    println!("{}", serde_json::to_string_pretty(&json)?);

    Ok(())
}
