use std::path::Path;

use anyhow::bail;

use cutover_core::CutoverConfig;

pub fn init(config_path: &Path, environment: &str, port: u16) -> anyhow::Result<()> {
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }
    let config = CutoverConfig::scaffold(environment, port);
    std::fs::write(config_path, config.to_toml_string()?)?;
    println!("✓ Generated {}", config_path.display());
    Ok(())
}
