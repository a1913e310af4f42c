//! Metadata extractor (§4.C).
//!
//! Walks a file's `(message, tool_output?)` stream and produces the bounded,
//! tool-derived metadata record stamped onto every chunk from that file:
//! files touched, tool-use counts, git diff output, and a concept taxonomy.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::models::ChunkMetadata;
use crate::transcript::{ContentItem, Content, Message, ToolUse};

const MAX_FILES_READ: usize = 20;
const MAX_FILES_EDITED: usize = 10;
const MAX_FILES_CREATED: usize = 10;
const MAX_TOOL_OUTPUTS: usize = 15;
const TOOL_OUTPUT_PREVIEW_CHARS: usize = 500;
const MAX_CONCEPTS: usize = 15;
const CONCEPT_SCAN_CAP_BYTES: usize = 50_000;
const MAX_PATTERNS_PER_CATEGORY: usize = 5;

/// One entry of the fixed concept taxonomy: a name plus the regexes that
/// trigger it.
struct ConceptRule {
    name: &'static str,
    patterns: &'static [&'static str],
}

const CONCEPT_TABLE: &[ConceptRule] = &[
    ConceptRule { name: "security", patterns: &[r"(?i)\bauth\w*\b", r"(?i)\bsecurity\b", r"(?i)\bvulnerabilit\w*\b", r"(?i)\bencrypt\w*\b", r"(?i)\bCVE-\d+"] },
    ConceptRule { name: "performance", patterns: &[r"(?i)\bperformance\b", r"(?i)\boptimiz\w*\b", r"(?i)\blatency\b", r"(?i)\bbenchmark\w*\b", r"(?i)\bprofil\w*\b"] },
    ConceptRule { name: "testing", patterns: &[r"(?i)\btest\w*\b", r"(?i)\bpytest\b", r"(?i)\bassert\w*\b", r"(?i)\bmock\w*\b", r"(?i)\bcoverage\b"] },
    ConceptRule { name: "docker", patterns: &[r"(?i)\bdocker\w*\b", r"(?i)\bcontainer\w*\b", r"(?i)\bdockerfile\b", r"(?i)\bcompose\b"] },
    ConceptRule { name: "api", patterns: &[r"(?i)\bapi\b", r"(?i)\bendpoint\w*\b", r"(?i)\brest\w*\b", r"(?i)\bgraphql\b", r"(?i)\bwebhook\w*\b"] },
    ConceptRule { name: "database", patterns: &[r"(?i)\bdatabase\w*\b", r"(?i)\bsql\b", r"(?i)\bquery\w*\b", r"(?i)\bmigration\w*\b", r"(?i)\bschema\b"] },
    ConceptRule { name: "authentication", patterns: &[r"(?i)\blogin\b", r"(?i)\boauth\b", r"(?i)\bjwt\b", r"(?i)\bsession\w*\b", r"(?i)\btoken\w*\b"] },
    ConceptRule { name: "debugging", patterns: &[r"(?i)\bdebug\w*\b", r"(?i)\bfix\w*\b", r"(?i)\bbug\w*\b", r"(?i)\bstack\s*trace\b", r"(?i)\btraceback\b"] },
    ConceptRule { name: "refactoring", patterns: &[r"(?i)\brefactor\w*\b", r"(?i)\bclean\s*up\b", r"(?i)\brestructur\w*\b", r"(?i)\bextract\w*\b"] },
    ConceptRule { name: "deployment", patterns: &[r"(?i)\bdeploy\w*\b", r"(?i)\brelease\w*\b", r"(?i)\bci[/-]?cd\b", r"(?i)\bpipeline\w*\b"] },
    ConceptRule { name: "git", patterns: &[r"(?i)\bgit\s+\w+\b", r"(?i)\bcommit\w*\b", r"(?i)\bbranch\w*\b", r"(?i)\bmerge\w*\b", r"(?i)\brebase\b"] },
    ConceptRule { name: "architecture", patterns: &[r"(?i)\barchitectur\w*\b", r"(?i)\bdesign\s+pattern\w*\b", r"(?i)\bmicroservice\w*\b"] },
    ConceptRule { name: "tool-protocol", patterns: &[r"(?i)\bmcp\b", r"(?i)\bmodel\s+context\s+protocol\b", r"(?i)\btool\s+call\w*\b"] },
    ConceptRule { name: "embeddings", patterns: &[r"(?i)\bembedding\w*\b", r"(?i)\bvector\w*\b", r"(?i)\bsemantic\s+search\b", r"(?i)\bqdrant\b"] },
    ConceptRule { name: "search", patterns: &[r"(?i)\bsearch\w*\b", r"(?i)\bquery\w*\b", r"(?i)\bretriev\w*\b", r"(?i)\branking\b"] },
];

fn compiled_concept_table() -> &'static Vec<(&'static str, Vec<Regex>)> {
    static CELL: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    CELL.get_or_init(|| {
        CONCEPT_TABLE
            .iter()
            .map(|rule| {
                let compiled = rule
                    .patterns
                    .iter()
                    .map(|p| Regex::new(p).expect("concept pattern is a valid regex"))
                    .collect();
                (rule.name, compiled)
            })
            .collect()
    })
}

/// One entry of the fixed code-pattern taxonomy: a category name plus the
/// regexes whose whole match is recorded as a pattern instance.
struct CodePatternRule {
    category: &'static str,
    patterns: &'static [&'static str],
}

const CODE_PATTERN_TABLE: &[CodePatternRule] = &[
    CodePatternRule {
        category: "async_patterns",
        patterns: &[r"\basync\s+(?:def|fn)\s+\w+", r"\bawait\s+[\w.]+", r"\.then\(", r"\bPromise\.\w+"],
    },
    CodePatternRule {
        category: "error_handling",
        patterns: &[r"\btry\s*:", r"\bexcept\s+\w+", r"\bcatch\s*\(", r"\bResult<[^>{}]*>", r"\.unwrap\(\)"],
    },
    CodePatternRule {
        category: "react_hooks",
        patterns: &[r"\buseState\(", r"\buseEffect\(", r"\buseMemo\(", r"\buseCallback\(", r"\buseContext\("],
    },
    CodePatternRule {
        category: "database_patterns",
        patterns: &[r"(?i)\bSELECT\s+\S.*?\bFROM\b", r"(?i)\bINSERT\s+INTO\b", r"(?i)\bCREATE\s+TABLE\b", r"\.query\("],
    },
    CodePatternRule {
        category: "testing_patterns",
        patterns: &[r"#\[test\]", r"\bdef\s+test_\w+", r#"\bit\(['"]"#, r#"\bdescribe\(['"]"#],
    },
];

fn compiled_code_pattern_table() -> &'static Vec<(&'static str, Vec<Regex>)> {
    static CELL: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    CELL.get_or_init(|| {
        CODE_PATTERN_TABLE
            .iter()
            .map(|rule| {
                let compiled = rule
                    .patterns
                    .iter()
                    .map(|p| Regex::new(p).expect("code pattern is a valid regex"))
                    .collect();
                (rule.category, compiled)
            })
            .collect()
    })
}

/// Scans `text` for the code-pattern taxonomy and returns a bounded
/// per-category map of the distinct snippets matched, or `None` if nothing
/// matched.
fn extract_code_patterns(text: &str) -> Option<HashMap<String, Vec<String>>> {
    let mut found: HashMap<String, Vec<String>> = HashMap::new();
    for (category, patterns) in compiled_code_pattern_table() {
        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for re in patterns {
            for m in re.find_iter(text) {
                if matches.len() >= MAX_PATTERNS_PER_CATEGORY {
                    break;
                }
                let snippet = truncate(m.as_str().trim(), 80);
                if !snippet.is_empty() && seen.insert(snippet.clone()) {
                    matches.push(snippet);
                }
            }
        }
        if !matches.is_empty() {
            found.insert(category.to_string(), matches);
        }
    }
    if found.is_empty() {
        None
    } else {
        Some(found)
    }
}

fn git_patterns() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        [
            r"^diff --git a/(.+) b/(.+)$",
            r"^--- a/(.+)$",
            r"^\+\+\+ b/(.+)$",
            r"^(?:modified|new file|deleted):\s+(.+)$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("git pattern is valid"))
        .collect()
    })
}

fn normalize_path(path: &str) -> String {
    let home = std::env::var("HOME").unwrap_or_default();
    let mut p = path.replace('\\', "/");
    if !home.is_empty() && p.starts_with(&home) {
        p = format!("~{}", &p[home.len()..]);
    }
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    p
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

fn push_capped(list: &mut Vec<String>, seen: &mut HashSet<String>, value: String, cap: usize) {
    if list.len() >= cap || !seen.insert(value.clone()) {
        return;
    }
    list.push(value);
}

/// Extracts the file path a tool use targets, from whichever `input` field
/// that tool convention puts it under.
fn tool_file_path(tool: &ToolUse) -> Option<String> {
    tool.input
        .get("file_path")
        .or_else(|| tool.input.get("path"))
        .or_else(|| tool.input.get("notebook_path"))
        .and_then(|v| v.as_str())
        .map(normalize_path)
}

/// Runs the full extraction over every message in a file, producing the
/// bounded metadata record stamped onto that file's chunks.
pub fn extract_metadata(messages: &[Message], tool_outputs_by_id: &HashMap<String, String>) -> ChunkMetadata {
    let mut files_read = Vec::new();
    let mut files_edited = Vec::new();
    let mut files_created = Vec::new();
    let mut tool_summary: HashMap<String, u32> = HashMap::new();
    let mut tools_used = Vec::new();
    let mut grep_searches = Vec::new();
    let mut bash_commands = Vec::new();
    let mut glob_patterns = Vec::new();
    let mut task_calls = Vec::new();
    let mut web_searches = Vec::new();
    let mut git_file_changes = Vec::new();
    let mut tool_outputs = Vec::new();

    let mut seen_read = HashSet::new();
    let mut seen_edited = HashSet::new();
    let mut seen_created = HashSet::new();
    let mut seen_tools = HashSet::new();

    let mut combined_text = String::new();

    for msg in messages {
        combined_text.push_str(&msg.text());
        combined_text.push('\n');

        for tool in msg.tool_uses() {
            if seen_tools.insert(tool.name.clone()) {
                tools_used.push(tool.name.clone());
            }
            *tool_summary.entry(tool.name.clone()).or_insert(0) += 1;

            match tool.name.as_str() {
                "Read" | "NotebookRead" => {
                    if let Some(p) = tool_file_path(tool) {
                        push_capped(&mut files_read, &mut seen_read, p, MAX_FILES_READ);
                    }
                }
                "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => {
                    if let Some(p) = tool_file_path(tool) {
                        if tool.name == "Write" {
                            push_capped(&mut files_created, &mut seen_created, p.clone(), MAX_FILES_CREATED);
                        }
                        push_capped(&mut files_edited, &mut seen_edited, p, MAX_FILES_EDITED);
                    }
                }
                "Grep" => {
                    if let Some(pat) = tool.input.get("pattern").and_then(|v| v.as_str()) {
                        if grep_searches.len() < MAX_TOOL_OUTPUTS {
                            grep_searches.push(truncate(pat, 200));
                        }
                    }
                }
                "Glob" => {
                    if let Some(pat) = tool.input.get("pattern").and_then(|v| v.as_str()) {
                        if glob_patterns.len() < MAX_TOOL_OUTPUTS {
                            glob_patterns.push(truncate(pat, 200));
                        }
                    }
                }
                "Bash" => {
                    if let Some(cmd) = tool.input.get("command").and_then(|v| v.as_str()) {
                        if bash_commands.len() < MAX_TOOL_OUTPUTS {
                            bash_commands.push(truncate(cmd, 200));
                        }
                        if let Some(id) = &tool.id {
                            if let Some(output) = tool_outputs_by_id.get(id) {
                                if cmd.trim_start().starts_with("git diff")
                                    || cmd.trim_start().starts_with("git show")
                                    || cmd.trim_start().starts_with("git status")
                                {
                                    for line in output.lines() {
                                        for re in git_patterns() {
                                            if let Some(caps) = re.captures(line) {
                                                if let Some(m) = caps.get(1) {
                                                    let f = m.as_str().to_string();
                                                    if !git_file_changes.contains(&f) {
                                                        git_file_changes.push(f);
                                                    }
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                "Task" => {
                    if let Some(desc) = tool.input.get("description").and_then(|v| v.as_str()) {
                        if task_calls.len() < MAX_TOOL_OUTPUTS {
                            task_calls.push(truncate(desc, 200));
                        }
                    }
                }
                "WebSearch" | "WebFetch" => {
                    if let Some(q) = tool
                        .input
                        .get("query")
                        .or_else(|| tool.input.get("url"))
                        .and_then(|v| v.as_str())
                    {
                        if web_searches.len() < MAX_TOOL_OUTPUTS {
                            web_searches.push(truncate(q, 200));
                        }
                    }
                }
                _ => {}
            }

            if let Some(id) = &tool.id {
                if let Some(output) = tool_outputs_by_id.get(id) {
                    if tool_outputs.len() < MAX_TOOL_OUTPUTS {
                        tool_outputs.push(truncate(output, TOOL_OUTPUT_PREVIEW_CHARS));
                    }
                }
            }
        }

        // Fallback text-scraping for transcripts without structured tool_use
        // items: only runs when the message carried plain text content.
        if matches!(msg.content, Content::Text(_)) {
            scrape_legacy_tool_mentions(
                &msg.text(),
                &mut files_read,
                &mut seen_read,
                &mut files_edited,
                &mut seen_edited,
                &mut grep_searches,
            );
        }
    }

    let scan_slice = if combined_text.len() > CONCEPT_SCAN_CAP_BYTES {
        &combined_text[..CONCEPT_SCAN_CAP_BYTES]
    } else {
        &combined_text[..]
    };

    let mut concepts = Vec::new();
    for (name, patterns) in compiled_concept_table() {
        if patterns.iter().any(|re| re.is_match(scan_slice)) {
            concepts.push(name.to_string());
        }
    }
    if bash_commands.iter().any(|c| c.to_lowercase().contains("docker")) && !concepts.iter().any(|c| c == "docker") {
        concepts.push("docker".to_string());
    }
    concepts.truncate(MAX_CONCEPTS);

    let code_patterns = extract_code_patterns(scan_slice);

    ChunkMetadata {
        metadata_version: 2,
        files_analyzed: files_read,
        files_edited,
        files_created,
        tools_used,
        tool_summary,
        search_patterns: grep_searches,
        bash_commands,
        glob_patterns,
        task_calls,
        web_searches,
        git_file_changes,
        tool_outputs,
        concepts,
        analysis_only: false,
        code_patterns,
        pattern_inheritance: None,
    }
}

/// Four line-anchored regexes plus a generic editing-keyword heuristic,
/// for transcript formats that predate structured `tool_use` items.
fn scrape_legacy_tool_mentions(
    text: &str,
    files_read: &mut Vec<String>,
    seen_read: &mut HashSet<String>,
    files_edited: &mut Vec<String>,
    seen_edited: &mut HashSet<String>,
    grep_searches: &mut Vec<String>,
) {
    static READING: OnceLock<Regex> = OnceLock::new();
    static EDITING: OnceLock<Regex> = OnceLock::new();
    static BACKTICK_GREP: OnceLock<Regex> = OnceLock::new();
    static KEYWORD_EDIT: OnceLock<Regex> = OnceLock::new();

    let reading = READING.get_or_init(|| Regex::new(r"(?i)Reading file:\s*(\S+)").unwrap());
    let editing = EDITING.get_or_init(|| Regex::new(r"(?i)Editing file:\s*(\S+)").unwrap());
    let backtick_grep = BACKTICK_GREP.get_or_init(|| Regex::new(r"`grep\s+[^`]+`").unwrap());
    let keyword_edit =
        KEYWORD_EDIT.get_or_init(|| Regex::new(r"(?i)\b(?:editing|modifying|updating)\s+([./\w-]+\.\w+)").unwrap());

    for caps in reading.captures_iter(text) {
        push_capped(files_read, seen_read, normalize_path(&caps[1]), MAX_FILES_READ);
    }
    for caps in editing.captures_iter(text) {
        push_capped(files_edited, seen_edited, normalize_path(&caps[1]), MAX_FILES_EDITED);
    }
    for m in backtick_grep.find_iter(text) {
        if grep_searches.len() < MAX_TOOL_OUTPUTS {
            grep_searches.push(truncate(m.as_str(), 200));
        }
    }
    for caps in keyword_edit.captures_iter(text) {
        push_capped(files_edited, seen_edited, normalize_path(&caps[1]), MAX_FILES_EDITED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::stream_messages;
    use std::io::Cursor;

    fn messages(raw: &str) -> Vec<Message> {
        stream_messages(Cursor::new(raw.as_bytes())).collect()
    }

    #[test]
    fn edit_tool_populates_files_edited() {
        let raw = r#"{"role":"assistant","content":[
            {"type":"tool_use","id":"tu_1","name":"Edit","input":{"file_path":"/p/config.py"}},
            {"type":"text","text":"Done."}
        ]}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert!(meta.tools_used.contains(&"Edit".to_string()));
        assert!(meta.files_edited.iter().any(|f| f.ends_with("config.py")));
    }

    #[test]
    fn no_trigger_words_yields_empty_concepts() {
        let raw = r#"{"role":"user","content":"Please edit config.py"}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert!(meta.concepts.is_empty());
    }

    #[test]
    fn security_trigger_word_is_detected() {
        let raw = r#"{"role":"user","content":"please review this for an authentication vulnerability"}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert!(meta.concepts.contains(&"security".to_string()));
    }

    #[test]
    fn concepts_are_capped_at_fifteen() {
        let raw = r#"{"role":"user","content":"security performance testing docker api database authentication debugging refactoring deployment git architecture mcp embeddings search extra"}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert!(meta.concepts.len() <= MAX_CONCEPTS);
    }

    #[test]
    fn bash_git_diff_output_populates_git_file_changes() {
        let raw = r#"{"role":"assistant","content":[
            {"type":"tool_use","id":"tu_9","name":"Bash","input":{"command":"git diff"}}
        ]}"#;
        let msgs = messages(raw);
        let mut outputs = HashMap::new();
        outputs.insert("tu_9".to_string(), "diff --git a/src/main.rs b/src/main.rs\n--- a/src/main.rs\n+++ b/src/main.rs\n".to_string());
        let meta = extract_metadata(&msgs, &outputs);
        assert!(meta.git_file_changes.iter().any(|f| f.contains("main.rs")));
    }

    #[test]
    fn files_read_cap_is_respected() {
        let mut msgs = Vec::new();
        for i in 0..30 {
            let raw = format!(
                r#"{{"role":"assistant","content":[{{"type":"tool_use","id":"tu_{i}","name":"Read","input":{{"file_path":"/p/file{i}.py"}}}}]}}"#
            );
            msgs.extend(messages(&raw));
        }
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert_eq!(meta.files_analyzed.len(), MAX_FILES_READ);
    }

    #[test]
    fn async_code_pattern_is_detected() {
        let raw = r#"{"role":"assistant","content":"async def process_batch(items):\n    await embed(items)"}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        let patterns = meta.code_patterns.expect("expected code patterns");
        assert!(patterns.contains_key("async_patterns"));
    }

    #[test]
    fn no_code_patterns_yields_none() {
        let raw = r#"{"role":"user","content":"just a plain english question"}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert!(meta.code_patterns.is_none());
    }

    #[test]
    fn legacy_text_scraping_catches_reading_file_mentions() {
        let raw = r#"{"role":"assistant","content":"Reading file: /p/legacy.py"}"#;
        let msgs = messages(raw);
        let meta = extract_metadata(&msgs, &HashMap::new());
        assert!(meta.files_analyzed.iter().any(|f| f.ends_with("legacy.py")));
    }
}
