//! The python dependency manifest (`requirements.txt`) and the mapping of installer failures
//! back to the requirement that caused them.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::errors::Error;

/// One requirement line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Distribution name as written.
    pub name: String,
    /// Extras, without brackets.
    pub extras: Vec<String>,
    /// Version specifier, e.g. `>=0.2,<1`. Empty when unpinned.
    pub specifier: String,
    /// The requirement as written, without comment or environment marker.
    pub line: String,
    /// 1-based line number in the manifest.
    pub line_number: usize,
    /// URL or path installed from, for direct references. The name is then taken from an
    /// `#egg=` fragment or the file name, and is empty when neither gives one.
    #[serde(default)]
    pub location: Option<String>,
}

impl Requirement {
    /// The normalized distribution name: lowercase, runs of `-`, `_` and `.` folded into `-`.
    pub fn normalized_name(&self) -> String {
        normalize(&self.name)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Normalize a distribution name the way package indexes compare them.
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            separator = true;
            continue;
        }
        if separator && !out.is_empty() {
            out.push('-');
        }
        separator = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// A parsed requirements manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Requirements, in file order.
    pub requirements: Vec<Requirement>,
    /// Installer option lines (`-r`, `--index-url`, ...) passed through untouched.
    pub options: Vec<String>,
}

impl Manifest {
    /// Parse manifest contents. Comments, blank lines and environment markers are dropped;
    /// option lines are kept aside.
    pub fn parse(contents: &str) -> Result<Manifest, Error> {
        let mut manifest = Manifest::default();

        for (index, raw) in contents.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('-') {
                manifest.options.push(line.to_owned());
                continue;
            }

            let line = line.split(';').next().unwrap_or_default().trim();
            let requirement = match parse_requirement(line, index + 1) {
                Some(requirement) if requirement.location.is_some() || !is_reference(line) => {
                    Some(requirement)
                }
                _ => parse_reference(line, index + 1),
            }
            .ok_or_else(|| Error::DependencyResolution {
                requirement: Some(line.to_owned()),
                message: format!("line {} is not a valid requirement", index + 1),
            })?;
            manifest.requirements.push(requirement);
        }

        Ok(manifest)
    }

    /// Whether the manifest names no requirement at all.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.options.is_empty()
    }

    /// The requirement providing distribution `name`, compared normalized.
    pub fn find(&self, name: &str) -> Option<&Requirement> {
        let wanted = normalize(name);
        self.requirements
            .iter()
            .find(|r| r.normalized_name() == wanted)
    }

    /// Find the requirement an installer failure is about.
    ///
    /// Returns the manifest line when the name pip reports matches an entry, the reported name
    /// otherwise, and `None` when the output names no requirement.
    pub fn failing_requirement(&self, output: &str) -> Option<String> {
        let name = reported_requirement(output)?;
        match self.find(&name) {
            Some(requirement) => Some(requirement.line.clone()),
            None => Some(name),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(i) => &line[..i],
        None => line,
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn parse_requirement(line: &str, line_number: usize) -> Option<Requirement> {
    let name_end = line.find(|c: char| !is_name_char(c)).unwrap_or(line.len());
    let name = &line[..name_end];
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }

    let mut rest = line[name_end..].trim_start();
    let mut extras = Vec::new();
    if let Some(inner) = rest.strip_prefix('[') {
        let close = inner.find(']')?;
        extras = inner[..close]
            .split(',')
            .map(|e| e.trim().to_owned())
            .filter(|e| !e.is_empty())
            .collect();
        rest = inner[close + 1..].trim_start();
    }

    // direct references (`name @ url`) carry no specifier
    let location = rest.strip_prefix('@').map(|url| url.trim().to_owned());
    let specifier = if location.is_some() {
        String::new()
    } else {
        if !(rest.is_empty() || rest.starts_with(['=', '<', '>', '!', '~', '('])) {
            return None;
        }
        rest.trim_start_matches('(')
            .trim_end_matches(')')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect()
    };

    Some(Requirement {
        name: name.to_owned(),
        extras,
        specifier,
        line: line.to_owned(),
        line_number,
        location,
    })
}

/// URLs, local paths and archive files the installer accepts in place of a name.
fn is_reference(line: &str) -> bool {
    line.contains("://")
        || line.starts_with(['.', '/', '~'])
        || [".whl", ".tar.gz", ".tgz", ".zip"]
            .iter()
            .any(|ext| line.ends_with(*ext))
}

fn parse_reference(line: &str, line_number: usize) -> Option<Requirement> {
    if !is_reference(line) || line.contains(char::is_whitespace) {
        return None;
    }
    Some(Requirement {
        name: reference_name(line).unwrap_or_default(),
        extras: Vec::new(),
        specifier: String::new(),
        line: line.to_owned(),
        line_number,
        location: Some(line.to_owned()),
    })
}

fn reference_name(location: &str) -> Option<String> {
    let (path, fragment) = match location.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (location, None),
    };
    let egg = fragment.and_then(|f| f.split('&').find_map(|p| p.strip_prefix("egg=")));

    let name = match egg {
        Some(egg) => egg,
        None => {
            let path = path.split('?').next().unwrap_or_default();
            let file = path.trim_end_matches('/').rsplit('/').next()?;
            // a VCS revision follows the repository: `repo.git@v1.0`
            let file = file.split('@').next().unwrap_or_default();
            if let Some(wheel) = file.strip_suffix(".whl") {
                wheel.split('-').next().unwrap_or_default()
            } else if let Some(archive) = [".tar.gz", ".tgz", ".zip"]
                .iter()
                .find_map(|ext| file.strip_suffix(*ext))
            {
                archive.rsplit_once('-').map_or(archive, |(name, _)| name)
            } else {
                file.strip_suffix(".git").unwrap_or(file)
            }
        }
    };

    let valid =
        name.starts_with(|c: char| c.is_ascii_alphanumeric()) && name.chars().all(is_name_char);
    valid.then(|| name.to_owned())
}

const REPORT_PREFIXES: [&str; 4] = [
    "No matching distribution found for ",
    "Could not find a version that satisfies the requirement ",
    "Cannot install ",
    "The user requested ",
];

fn reported_requirement(output: &str) -> Option<String> {
    for line in output.lines() {
        for prefix in REPORT_PREFIXES {
            if let Some(idx) = line.find(prefix) {
                let tail = &line[idx + prefix.len()..];
                let name: String = tail.chars().take_while(|c| is_name_char(*c)).collect();
                let name = name.trim_end_matches('.');
                if !name.is_empty() {
                    return Some(name.to_owned());
                }
            }
        }
    }
    None
}

/// Whether installer output looks like a network or index hiccup worth retrying.
///
/// Resolution conflicts are never transient.
pub fn is_transient(output: &str) -> bool {
    const MARKERS: [&str; 9] = [
        "Temporary failure in name resolution",
        "temporary error",
        "Connection reset",
        "Connection refused",
        "ConnectionError",
        "NewConnectionError",
        "timed out",
        "Network is unreachable",
        "502 Bad Gateway",
    ];
    if output.contains("ResolutionImpossible") || output.contains("conflicting dependencies") {
        return false;
    }
    MARKERS.iter().any(|m| output.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIREMENTS: &str = "\
# media helpers
ffmpy==0.3.2
python-pptx >= 0.6.21  # slides

-r extra.txt
Pillow[webp]; python_version >= \"3.8\"
";

    #[test]
    fn parses_requirements_and_options() {
        let manifest = Manifest::parse(REQUIREMENTS).unwrap();
        assert_eq!(manifest.requirements.len(), 3);
        assert_eq!(manifest.options, vec!["-r extra.txt"]);

        let ffmpy = &manifest.requirements[0];
        assert_eq!(ffmpy.name, "ffmpy");
        assert_eq!(ffmpy.specifier, "==0.3.2");
        assert_eq!(ffmpy.line_number, 2);

        let pptx = &manifest.requirements[1];
        assert_eq!(pptx.specifier, ">=0.6.21");
        assert_eq!(pptx.line, "python-pptx >= 0.6.21");

        let pillow = &manifest.requirements[2];
        assert_eq!(pillow.extras, vec!["webp"]);
        assert_eq!(pillow.line, "Pillow[webp]");
    }

    #[test]
    fn rejects_garbage_lines() {
        match Manifest::parse("ffmpy\n%%%\n") {
            Err(Error::DependencyResolution { requirement, .. }) => {
                assert_eq!(requirement.as_deref(), Some("%%%"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn direct_references_pass_through() {
        let manifest = Manifest::parse(
            "git+https://github.com/scanny/python-pptx.git#egg=python-pptx
./vendor/ffmpy
https://files.example.org/packages/ffmpy-0.3.2-py3-none-any.whl
https://files.example.org/archive/Pillow-10.4.0.tar.gz
imageio @ https://files.example.org/imageio-2.35.1-py3-none-any.whl
",
        )
        .unwrap();
        assert_eq!(manifest.requirements.len(), 5);
        assert!(manifest
            .requirements
            .iter()
            .all(|r| r.location.is_some() && r.specifier.is_empty()));

        let pptx = manifest.find("python-pptx").unwrap();
        assert_eq!(
            pptx.location.as_deref(),
            Some("git+https://github.com/scanny/python-pptx.git#egg=python-pptx")
        );
        assert_eq!(manifest.requirements[1].name, "ffmpy");
        assert_eq!(manifest.requirements[2].name, "ffmpy");
        assert!(manifest.find("pillow").is_some());
        assert_eq!(manifest.find("imageio").unwrap().line_number, 5);
    }

    #[test]
    fn unnamed_references_are_kept() {
        let manifest = Manifest::parse("https://example.org/builds/%7Elatest\n").unwrap();
        assert_eq!(manifest.requirements[0].name, "");
        assert!(!manifest.is_empty());
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize("Python_PPTX"), "python-pptx");
        assert_eq!(normalize("zope.interface"), "zope-interface");
        let manifest = Manifest::parse("python-pptx\n").unwrap();
        assert!(manifest.find("python_pptx").is_some());
    }

    #[test]
    fn maps_pip_errors_to_manifest_lines() {
        let manifest = Manifest::parse(REQUIREMENTS).unwrap();

        let output = "\
ERROR: Could not find a version that satisfies the requirement ffmpy==0.3.2 (from versions: 0.2.3)
ERROR: No matching distribution found for ffmpy==0.3.2";
        assert_eq!(
            manifest.failing_requirement(output).as_deref(),
            Some("ffmpy==0.3.2")
        );

        let output = "\
ERROR: Cannot install python-pptx>=0.6.21 and lxml==3.0 because these package versions have conflicting dependencies.
ERROR: ResolutionImpossible: for help visit https://pip.pypa.io/";
        assert_eq!(
            manifest.failing_requirement(output).as_deref(),
            Some("python-pptx >= 0.6.21")
        );

        assert_eq!(
            manifest
                .failing_requirement("ERROR: No matching distribution found for leftpad")
                .as_deref(),
            Some("leftpad")
        );
        assert_eq!(manifest.failing_requirement("Killed"), None);
    }

    #[test]
    fn transient_failures() {
        assert!(is_transient(
            "WARNING: Retrying after connection broken by 'NewConnectionError'"
        ));
        assert!(is_transient(
            "ERROR: https://dl-cdn.alpinelinux.org/alpine/v3.20/main: temporary error (try again later)"
        ));
        assert!(!is_transient("ERROR: ResolutionImpossible: timed out"));
        assert!(!is_transient("ERROR: unable to select packages:\n  ffmpeg (no such package)"));
    }
}
