//! `quill config`: Configuration management commands.

use quill_config::AppConfig;
use quill_engine::ModelScanner;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();

            if !config.models_dir.is_dir() {
                warnings.push(format!(
                    "Models directory does not exist: {}",
                    config.models_dir.display()
                ));
            }

            match &config.model_path {
                Some(path) if !path.is_file() => {
                    warnings.push(format!("model_path does not exist: {}", path.display()));
                }
                Some(_) => {}
                None => {
                    if ModelScanner::new(&config.models_dir).first_valid().is_none() {
                        warnings.push("No usable .gguf model in the models directory".to_string());
                    }
                }
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Models:    {}", config.models_dir.display());
            if let Some(path) = &config.model_path {
                println!("   Model:     {}", path.display());
            }
            println!(
                "   Mode:      {}",
                if config.streaming { "streaming" } else { "static" }
            );
            println!(
                "   Sampling:  temperature {} · top_p {} · top_k {} · max_tokens {}",
                config.session.temperature,
                config.session.top_p,
                config.session.top_k,
                config.session.max_tokens
            );
            println!("   History:   {} exchanges", config.session.max_history_pairs);
            println!("   Threads:   {}", config.engine.thread_hint());
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = AppConfig::config_path();
    if path.exists() && !force {
        println!("   Config already exists: {}", path.display());
        println!("   Use --force to overwrite it.");
        return Ok(());
    }

    let config = AppConfig::default();
    config.save_to(&path)?;
    std::fs::create_dir_all(&config.models_dir)?;
    println!("   ✅ Wrote {}", path.display());
    println!("   Put .gguf model files in {}", config.models_dir.display());
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn config_path_is_valid() {
        let path = quill_config::AppConfig::config_path();
        assert!(path.to_str().unwrap().ends_with("config.toml"));
    }
}
