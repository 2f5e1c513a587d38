use std::path::Path;

use anyhow::Result;

use crate::config::Config;

pub fn run(config_dir: &Path) -> Result<()> {
    if config_dir.join("backup.config").exists() {
        anyhow::bail!(
            "{} already has a backup.config; refusing to overwrite an existing backup identity",
            config_dir.display()
        );
    }

    let mut prompt = |question: &str| -> Result<String> {
        if question.to_lowercase().contains("secret") {
            Ok(rpassword::prompt_password(format!("{}: ", question))?)
        } else {
            print!("{}: ", question);
            use std::io::Write;
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line.trim().to_string())
        }
    };

    let config = Config::init(config_dir, &mut prompt)?;
    println!(
        "initialized a new backup identity {} under {}",
        config.uuid,
        config_dir.display()
    );
    Ok(())
}
