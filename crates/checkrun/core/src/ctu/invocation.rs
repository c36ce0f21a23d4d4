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

//! Normalized compiler invocations for the AST analyzer.

use super::CtuResult;
use checkrun_common::{BuildAction, CheckerConfig};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const INVOCATION_LIST_NAME: &str = "invocation-list.yml";

/// The reproducible compile command for one action:
/// `clang [--target=T] [-isystem DIR].. -c -x LANG ARGS.. SOURCE [STD]`.
pub fn compile_command(action: &BuildAction, clang: &str) -> Vec<String> {
    let mut cmd = vec![clang.to_string()];
    if let Some(target) = &action.target {
        cmd.push(format!("--target={target}"));
    }
    for dir in &action.system_includes {
        cmd.push("-isystem".to_string());
        cmd.push(dir.clone());
    }
    cmd.push("-c".to_string());
    cmd.push("-x".to_string());
    cmd.push(action.language.clone());
    cmd.extend(action.compiler_args.iter().cloned());
    cmd.push(action.absolute_source().display().to_string());

    let has_std = cmd.iter().any(|arg| arg.starts_with("-std") || arg.starts_with("--std"));
    if let (false, Some(standard)) = (has_std, &action.standard) {
        cmd.push(standard.clone());
    }
    cmd
}

/// Compile command plus the analyzer defines and the host's system options.
pub fn analyzer_invocation(action: &BuildAction, checkers: &CheckerConfig) -> Vec<String> {
    let mut cmd = compile_command(action, &checkers.clang_bin);
    cmd.push("-D__clang_analyzer__".to_string());
    cmd.push("-w".to_string());
    cmd.extend(checkers.system_lib_options.split_whitespace().map(str::to_string));
    cmd.extend(checkers.gcc_predefined_macros.split_whitespace().map(str::to_string));
    cmd
}

/// Compile command with `-###` after the compiler, so the driver prints its sub-commands.
pub fn driver_dump_command(action: &BuildAction, clang: &str) -> Vec<String> {
    let mut cmd = compile_command(action, clang);
    cmd.insert(1, "-###".to_string());
    cmd
}

/// Architecture component of the `-triple` value in a `clang -###` dump.
///
/// ```text
/// "/usr/bin/clang-14" "-cc1" "-triple" "x86_64-redhat-linux-gnu" ...
/// ```
/// yields `x86_64`.
pub fn find_arch_in_driver_output(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "\"-triple\"" {
            continue;
        }
        let triple = tokens.next()?.trim_matches('"');
        return triple.split('-').next().filter(|arch| !arch.is_empty()).map(str::to_string);
    }
    None
}

/// Append-only `source: [argv..]` lists, one file per architecture.
#[derive(Debug)]
pub struct InvocationList {
    ctu_dir: PathBuf,
    lock: Mutex<()>,
}

impl InvocationList {
    pub fn new(ctu_dir: impl Into<PathBuf>) -> Self {
        Self {
            ctu_dir: ctu_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self, arch: &str) -> PathBuf {
        self.ctu_dir.join(arch).join(INVOCATION_LIST_NAME)
    }

    pub fn append(&self, arch: &str, source: &Path, invocation: Vec<String>) -> CtuResult<()> {
        let mut entry = BTreeMap::new();
        entry.insert(source.display().to_string(), invocation);
        let text = serde_yaml::to_string(&entry)?;

        let _guard = self.lock.lock();
        let path = self.path(arch);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}
