// main.rs - thin CLI wrapping the OMR pipeline: scan a directory of sheets, write annotated JPEGs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use bubblesheet_omr::{ImageInput, MarkingScheme, PipelineConfig, TemplateConfig};
use clap::Parser;
use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bubblesheet-omr", about = "Scan bubble-sheet exam images and report detected answers")]
struct Cli {
    /// Directory of input images (png/jpg).
    #[arg(short = 'i', long = "inputDir", default_value = "inputs")]
    input_dir: PathBuf,

    /// Directory where annotated images are written.
    #[arg(short = 'o', long = "outputDir", default_value = "outputs")]
    output_dir: PathBuf,

    /// Template JSON file; falls back to the built-in default template.
    #[arg(short = 't', long = "template")]
    template: Option<PathBuf>,

    /// Answer key CSV with `question,answer` columns.
    #[arg(short = 'k', long = "answerKey")]
    answer_key: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    correct: f64,
    #[arg(long, default_value_t = 0.0)]
    incorrect: f64,
    #[arg(long, default_value_t = 0.0)]
    unmarked: f64,
}

fn load_template(path: &Path) -> Result<TemplateConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading template file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing template JSON {}", path.display()))
}

fn load_answer_key(path: &Path) -> Result<IndexMap<String, String>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("reading answer key {}", path.display()))?;
    let mut key = IndexMap::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 2 {
            continue;
        }
        key.insert(record[0].trim().to_string(), record[1].trim().to_string());
    }
    Ok(key)
}

fn is_image_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("png") | Some("jpg") | Some("jpeg")
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let template_config = cli.template.as_deref().map(load_template).transpose()?;
    let answer_key = cli.answer_key.as_deref().map(load_answer_key).transpose()?;
    let marking_scheme = MarkingScheme { correct: cli.correct, incorrect: cli.incorrect, unmarked: cli.unmarked };
    let pipeline_config = PipelineConfig::default();

    fs::create_dir_all(&cli.output_dir).with_context(|| format!("creating output directory {}", cli.output_dir.display()))?;

    let entries = fs::read_dir(&cli.input_dir).with_context(|| format!("reading input directory {}", cli.input_dir.display()))?;
    let mut image_paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_image_file(p))
        .collect();
    image_paths.sort();

    let mut scanned = 0usize;
    let mut failed = 0usize;

    for path in &image_paths {
        let bytes = fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
        match bubblesheet_omr::process_omr_image(
            ImageInput::Bytes(&bytes),
            template_config.as_ref(),
            answer_key.as_ref(),
            Some(marking_scheme),
            Some(&pipeline_config),
        ) {
            Ok(result) => {
                scanned += 1;
                let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("sheet");
                let out_path = cli.output_dir.join(format!("{name}_annotated.jpg"));
                let jpeg_bytes = base64::engine::general_purpose::STANDARD
                    .decode(&result.annotated_image_base64)
                    .context("decoding annotated image base64")?;
                fs::write(&out_path, jpeg_bytes).with_context(|| format!("writing {}", out_path.display()))?;

                println!(
                    "{}: unmarked={} multi_marked={} score={:?} rectification={:?}",
                    path.display(),
                    result.unmarked_count,
                    result.multi_marked_count,
                    result.score,
                    result.rectification_outcome,
                );
            }
            Err(err) => {
                failed += 1;
                eprintln!("{}: failed: {err}", path.display());
            }
        }
    }

    println!("scanned {scanned} sheet(s), {failed} failure(s)");
    if failed > 0 && scanned == 0 {
        std::process::exit(1);
    }
    Ok(())
}
