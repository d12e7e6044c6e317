//! `quill models`: List model files in the models directory.

use quill_config::AppConfig;
use quill_engine::{ModelScanner, format_size};
use std::path::PathBuf;

pub async fn run(dir: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            AppConfig::load()
                .map_err(|e| format!("Failed to load config: {e}"))?
                .models_dir
        }
    };

    let scanner = ModelScanner::new(&dir);
    let models = scanner.scan();

    println!();
    println!("  Models in {}", scanner.dir().display());
    println!();

    if models.is_empty() {
        println!("  No .gguf files found.");
        println!();
        return Ok(());
    }

    for model in &models {
        let marker = if model.is_valid { "✅" } else { "⚠️ " };
        println!(
            "  {marker} {:<48} {:>10}   {}",
            model.name,
            format_size(model.size_bytes),
            model.last_modified.format("%Y-%m-%d %H:%M")
        );
    }

    let invalid = models.iter().filter(|m| !m.is_valid).count();
    println!();
    if invalid > 0 {
        println!("  ⚠️  {invalid} file(s) too small to be a usable model (under 50 MB).");
        println!();
    }
    Ok(())
}
