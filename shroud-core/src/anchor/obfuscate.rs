//! Deterministic source obfuscation for the startup-artifact source
//!
//! Two passes, both seeded so repeated builds of the same input produce the
//! same output: string-literal splitting and a lightweight control-flow
//! flattening that routes top-level statement groups through a shuffled
//! dispatch table. Declarations stay hoistable (no wrapper scope), so the
//! flattened source keeps the original's bindings.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed shared by every build. Reproducibility matters more than hiding the
/// seed: the artifact digest must be stable across rebuilds of the same
/// input.
pub const OBFUSCATION_SEED: u64 = 10;

/// Literals shorter than this are left alone.
const MIN_SPLIT_LEN: usize = 8;

/// Obfuscate a source string with the given seed.
pub fn obfuscate(source: &str, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let split = split_string_literals(source, &mut rng);
    flatten_control_flow(&split, &mut rng)
}

/// Split single-quoted string literals into concatenated fragments.
/// Literals containing escapes are copied verbatim; splitting them would
/// need a real lexer.
fn split_string_literals(source: &str, rng: &mut StdRng) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '\'' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        // Scan for the closing quote on the same line, honoring escapes.
        let mut j = i + 1;
        let mut has_escape = false;
        let mut close = None;
        while j < chars.len() {
            match chars[j] {
                '\\' => {
                    has_escape = true;
                    j += 2;
                }
                '\n' => break,
                '\'' => {
                    close = Some(j);
                    break;
                }
                _ => j += 1,
            }
        }

        let Some(end) = close else {
            out.push('\'');
            i += 1;
            continue;
        };

        let literal: String = chars[i + 1..end].iter().collect();
        if has_escape || literal.chars().count() < MIN_SPLIT_LEN {
            out.extend(&chars[i..=end]);
        } else {
            out.push_str(&split_literal(&literal, rng));
        }
        i = end + 1;
    }

    out
}

/// Render one literal as `'frag' + 'frag' + ...` with fragment lengths of
/// 2..=6 characters.
fn split_literal(literal: &str, rng: &mut StdRng) -> String {
    let chars: Vec<char> = literal.chars().collect();
    let mut fragments = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let len = rng.gen_range(2..=6).min(chars.len() - pos);
        let fragment: String = chars[pos..pos + len].iter().collect();
        fragments.push(format!("'{fragment}'"));
        pos += len;
    }

    fragments.join(" + ")
}

/// Route top-level statement groups through a dispatch loop whose case
/// labels are shuffled while the dispatch order preserves the original
/// execution sequence. Groups are split at blank lines outside any brace
/// nesting, so bodies stay intact.
fn flatten_control_flow(source: &str, rng: &mut StdRng) -> String {
    let groups = top_level_groups(source);
    if groups.len() < 2 {
        return source.to_string();
    }

    let mut labels: Vec<usize> = (0..groups.len()).collect();
    for i in (1..labels.len()).rev() {
        labels.swap(i, rng.gen_range(0..=i));
    }

    let order = labels
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut indexed: Vec<(usize, String)> = labels.iter().copied().zip(groups).collect();
    indexed.sort_by_key(|(label, _)| *label);

    let cases = indexed
        .into_iter()
        .map(|(label, group)| format!("case {label}:\n{group}\nbreak;"))
        .collect::<Vec<_>>()
        .join("\n");

    format!("var d = [{order}], i = 0;\nwhile (i < d.length) {{\nswitch (d[i++]) {{\n{cases}\n}}\n}}\n")
}

/// Split source into statement groups at blank lines with zero brace depth.
fn top_level_groups(source: &str) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;

    for line in source.lines() {
        if line.trim().is_empty() && depth == 0 {
            if !current.trim().is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            continue;
        }

        depth += brace_delta(line);
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        groups.push(current);
    }

    groups
}

/// Net brace nesting change for one line, ignoring braces inside
/// single-quoted literals.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_literal = false;
    let mut prev = ' ';

    for c in line.chars() {
        match c {
            '\'' if prev != '\\' => in_literal = !in_literal,
            '{' if !in_literal => delta += 1,
            '}' if !in_literal => delta -= 1,
            _ => {}
        }
        prev = c;
    }

    delta
}
