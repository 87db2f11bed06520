// ABOUTME: Line-oriented parser turning raw `git diff` text into the structured file/hunk/line model

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::models::{DiffLine, DiffStats, FileDiff, FileStatus, Hunk, LineKind};

lazy_static! {
    // Counts are omitted when they equal 1, e.g. `@@ -5 +5 @@`.
    static ref HUNK_HEADER: Regex =
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap();
    static ref FILE_HEADER: Regex = Regex::new(r"^diff --git a/(.*) b/(.*)$").unwrap();
}

/// Parse raw unified-diff output into an ordered list of [`FileDiff`]s.
///
/// Input may contain any number of concatenated `diff --git` sections,
/// optionally surrounded by `--stat` summary text (which is ignored; per-file
/// counts are always recomputed from the emitted lines). A malformed section
/// degrades to an empty hunk list for that file instead of aborting the
/// parse of its siblings.
pub fn parse(raw: &str) -> Vec<FileDiff> {
    let lines: Vec<&str> = raw.lines().collect();

    // Split the blob into file sections on `diff --git` headers. Anything
    // before the first header (stat summaries, command echoes) is advisory
    // and skipped.
    let mut section_starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("diff --git "))
        .map(|(i, _)| i)
        .collect();
    section_starts.push(lines.len());

    let mut files = Vec::new();
    for window in section_starts.windows(2) {
        let section = &lines[window[0]..window[1]];
        match parse_file_section(section) {
            Some(file) => files.push(file),
            None => warn!("skipping unparseable diff section: {:?}", section.first()),
        }
    }

    debug!("parsed {} file section(s)", files.len());
    files
}

/// Aggregate statistics over an already-parsed diff.
pub fn stats(files: &[FileDiff]) -> DiffStats {
    DiffStats {
        files_changed: files.len(),
        insertions: files.iter().map(|f| f.additions).sum(),
        deletions: files.iter().map(|f| f.deletions).sum(),
    }
}

/// One-line-per-file display summary, e.g. `M src/main.rs (+4 -1)`.
pub fn file_changes_summary(files: &[FileDiff]) -> Vec<String> {
    files
        .iter()
        .map(|file| {
            let status_symbol = match file.status {
                FileStatus::Added => "A",
                FileStatus::Modified => "M",
                FileStatus::Deleted => "D",
                FileStatus::Renamed => "R",
            };

            if file.additions > 0 || file.deletions > 0 {
                format!(
                    "{} {} (+{} -{})",
                    status_symbol, file.path, file.additions, file.deletions
                )
            } else {
                format!("{} {}", status_symbol, file.path)
            }
        })
        .collect()
}

fn parse_file_section(section: &[&str]) -> Option<FileDiff> {
    let header = section.first()?;
    let (old_header_path, new_header_path) = parse_header_paths(header)?;

    let mut status = if old_header_path == new_header_path {
        FileStatus::Modified
    } else {
        FileStatus::Renamed
    };
    let mut path = new_header_path.clone();
    let mut old_path = (status == FileStatus::Renamed).then(|| old_header_path.clone());

    // Binary wins no matter where the marker sits relative to hunk-shaped text.
    let is_binary = section.iter().any(|l| {
        (l.starts_with("Binary files ") && l.ends_with(" differ"))
            || l.starts_with("GIT binary patch")
    });

    // Walk the extended header lines, stopping where the hunks begin.
    let mut body_start = section.len();
    for (i, line) in section.iter().enumerate().skip(1) {
        if line.starts_with("new file mode") {
            status = FileStatus::Added;
            old_path = None;
        } else if line.starts_with("deleted file mode") {
            status = FileStatus::Deleted;
            old_path = None;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            status = FileStatus::Renamed;
            old_path = Some(from.to_string());
        } else if let Some(to) = line.strip_prefix("rename to ") {
            path = to.to_string();
        } else if line.starts_with("@@ ") {
            body_start = i;
            break;
        }
    }

    let mut file = FileDiff {
        path,
        old_path,
        status,
        additions: 0,
        deletions: 0,
        is_binary,
        hunks: Vec::new(),
    };

    if is_binary {
        return Some(file);
    }

    match parse_hunks(&section[body_start..]) {
        Ok(hunks) => {
            for hunk in &hunks {
                for line in &hunk.lines {
                    match line.kind {
                        LineKind::Add => file.additions += 1,
                        LineKind::Delete => file.deletions += 1,
                        LineKind::Context => {}
                    }
                }
            }
            file.hunks = hunks;
        }
        Err(reason) => {
            // One corrupt section must not lose the rest of the diff.
            warn!("malformed diff section for {}: {}", file.path, reason);
            file.hunks.clear();
            file.additions = 0;
            file.deletions = 0;
        }
    }

    Some(file)
}

fn parse_header_paths(header: &str) -> Option<(String, String)> {
    if let Some(caps) = FILE_HEADER.captures(header) {
        let old = caps.get(1)?.as_str();
        let new = caps.get(2)?.as_str();
        // Paths containing spaces make the `a/... b/...` split ambiguous; for
        // the equal-path case (by far the common one) the midpoint split
        // disambiguates.
        if old.contains(" b/") {
            let rest = header.strip_prefix("diff --git a/")?;
            // "X b/X" has length 2|X| + 3.
            if rest.len() > 3 && (rest.len() - 3) % 2 == 0 {
                let (left, right) = rest.split_at((rest.len() - 3) / 2);
                if let Some(right_path) = right.strip_prefix(" b/") {
                    if left == right_path {
                        return Some((left.to_string(), right_path.to_string()));
                    }
                }
            }
        }
        return Some((old.to_string(), new.to_string()));
    }
    None
}

fn parse_hunks(body: &[&str]) -> Result<Vec<Hunk>, String> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut old_line = 0u32;
    let mut new_line = 0u32;

    for line in body {
        if line.starts_with("@@ ") {
            let caps = HUNK_HEADER
                .captures(line)
                .ok_or_else(|| format!("bad hunk header: {line}"))?;
            let old_start = caps[1].parse::<u32>().map_err(|e| e.to_string())?;
            let old_count = parse_optional_count(caps.get(2))?;
            let new_start = caps[3].parse::<u32>().map_err(|e| e.to_string())?;
            let new_count = parse_optional_count(caps.get(4))?;

            if let Some(done) = current.take() {
                hunks.push(done);
            }
            old_line = old_start;
            new_line = new_start;
            current = Some(Hunk {
                old_start,
                old_line_count: old_count,
                new_start,
                new_line_count: new_count,
                lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            continue;
        };

        // `\ No newline at end of file` annotates the previous line; it
        // neither counts nor terminates the hunk.
        if line.starts_with('\\') {
            continue;
        }

        if let Some(content) = line.strip_prefix('+') {
            if line.starts_with("+++") {
                if let Some(done) = current.take() {
                    hunks.push(done);
                }
                continue;
            }
            hunk.lines.push(DiffLine {
                kind: LineKind::Add,
                content: content.to_string(),
                old_line_number: None,
                new_line_number: Some(new_line),
            });
            new_line += 1;
        } else if let Some(content) = line.strip_prefix('-') {
            if line.starts_with("---") {
                if let Some(done) = current.take() {
                    hunks.push(done);
                }
                continue;
            }
            hunk.lines.push(DiffLine {
                kind: LineKind::Delete,
                content: content.to_string(),
                old_line_number: Some(old_line),
                new_line_number: None,
            });
            old_line += 1;
        } else if let Some(content) = line.strip_prefix(' ') {
            hunk.lines.push(DiffLine {
                kind: LineKind::Context,
                content: content.to_string(),
                old_line_number: Some(old_line),
                new_line_number: Some(new_line),
            });
            old_line += 1;
            new_line += 1;
        } else {
            // Any other prefix ends the hunk body.
            if let Some(done) = current.take() {
                hunks.push(done);
            }
        }
    }

    if let Some(done) = current.take() {
        hunks.push(done);
    }

    // Truncation check: a hunk that promised lines it never delivered marks
    // the whole section as corrupt.
    for hunk in &hunks {
        let (mut old_seen, mut new_seen) = (0u32, 0u32);
        for line in &hunk.lines {
            match line.kind {
                LineKind::Context => {
                    old_seen += 1;
                    new_seen += 1;
                }
                LineKind::Delete => old_seen += 1,
                LineKind::Add => new_seen += 1,
            }
        }
        if old_seen != hunk.old_line_count || new_seen != hunk.new_line_count {
            return Err(format!(
                "hunk at -{} +{} declared {}/{} lines but contained {}/{}",
                hunk.old_start,
                hunk.new_start,
                hunk.old_line_count,
                hunk.new_line_count,
                old_seen,
                new_seen
            ));
        }
    }

    Ok(hunks)
}

fn parse_optional_count(cap: Option<regex::Match>) -> Result<u32, String> {
    match cap {
        // An omitted count means a single-line hunk.
        None => Ok(1),
        Some(m) => m.as_str().parse::<u32>().map_err(|e| e.to_string()),
    }
}
