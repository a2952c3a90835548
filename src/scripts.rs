//! Audit of the python scripts shared with n8n's Code nodes against the requirements manifest.
//!
//! A script importing a third-party module that no requirement provides fails at run time,
//! long after deployment. The audit reads the scripts' import statements and reports those
//! modules up front. Findings are advisory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::Error;
use crate::manifest::Manifest;

/// Import names whose distribution is named differently.
const ALIASES: &[(&str, &str)] = &[
    ("pptx", "python-pptx"),
    ("docx", "python-docx"),
    ("PIL", "pillow"),
    ("yaml", "pyyaml"),
    ("cv2", "opencv-python"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("sklearn", "scikit-learn"),
    ("dotenv", "python-dotenv"),
];

/// Standard library modules commonly found in Code node scripts.
const STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "asyncio", "base64", "binascii", "bisect",
    "calendar", "collections", "contextlib", "copy", "csv", "dataclasses", "datetime",
    "decimal", "difflib", "email", "enum", "errno", "fnmatch", "fractions", "functools",
    "gc", "getpass", "glob", "gzip", "hashlib", "heapq", "hmac", "html", "http", "io",
    "itertools", "json", "logging", "math", "mimetypes", "multiprocessing", "operator", "os",
    "pathlib", "pickle", "platform", "pprint", "queue", "random", "re", "secrets", "shlex",
    "shutil", "signal", "socket", "sqlite3", "statistics", "string", "struct", "subprocess",
    "sys", "tarfile", "tempfile", "textwrap", "threading", "time", "timeit", "traceback",
    "typing", "unicodedata", "unittest", "urllib", "uuid", "warnings", "weakref", "xml",
    "zipfile", "zlib", "zoneinfo",
];

/// A third-party import no requirement provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// The script.
    pub script: PathBuf,
    /// 1-based line of the import.
    pub line: usize,
    /// Top-level module name.
    pub module: String,
    /// The distribution expected to provide it.
    pub distribution: String,
}

/// The distribution expected to provide import `module`.
pub fn distribution_for(module: &str) -> String {
    ALIASES
        .iter()
        .find(|(import, _)| *import == module)
        .map(|(_, dist)| dist.to_string())
        .unwrap_or_else(|| module.to_owned())
}

/// Top-level modules imported on each line of `source`, with 1-based line numbers.
/// Relative imports are skipped.
pub fn imports(source: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for (index, line) in source.lines().enumerate() {
        let line = line.trim();
        let modules: Vec<&str> = if let Some(rest) = line.strip_prefix("import ") {
            rest.split(',')
                .map(|m| m.split_whitespace().next().unwrap_or_default())
                .collect()
        } else if let Some(rest) = line.strip_prefix("from ") {
            match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [module, "import", ..] => vec![*module],
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        };

        for module in modules {
            if module.is_empty() || module.starts_with('.') {
                continue;
            }
            let top = module.split('.').next().unwrap_or(module);
            out.push((index + 1, top.to_owned()));
        }
    }
    out
}

/// Check every `*.py` file in `dir` against `manifest`. A missing directory has no findings.
pub fn audit(dir: &Path, manifest: &Manifest) -> Result<Vec<Finding>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("no scripts directory at {}", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "py") && path.is_file() {
            scripts.push(path);
        }
    }
    scripts.sort();

    let mut findings = Vec::new();
    for script in scripts {
        let source = fs::read_to_string(&script)?;
        for (line, module) in imports(&source) {
            if STDLIB.contains(&module.as_str()) {
                continue;
            }
            let distribution = distribution_for(&module);
            if manifest.find(&distribution).is_none() {
                findings.push(Finding {
                    script: script.clone(),
                    line,
                    module,
                    distribution,
                });
            }
        }
    }
    Ok(findings)
}
