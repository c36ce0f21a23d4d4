// Checkrun
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use crate::ConfigCommands;
use anyhow::Result;
use checkrun_common::AnalysisConfig;
use std::path::Path;

pub fn handle_config_command(config: &AnalysisConfig, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => show_config(config),
        ConfigCommands::Init { path } => init_config(&path),
    }
}

fn show_config(config: &AnalysisConfig) -> Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(anyhow::anyhow!("Refusing to overwrite existing file {}", path.display()));
    }
    AnalysisConfig::default().save_to_file(path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkrun.toml");

        init_config(&path).unwrap();
        assert_eq!(AnalysisConfig::load_from_file(&path).unwrap(), AnalysisConfig::default());
        assert!(init_config(&path).is_err());
    }
}
