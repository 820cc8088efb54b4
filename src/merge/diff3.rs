// Line-level three-way merge.
//
// The three texts are segmented by newline and every distinct line is
// interned to an integer code, so the diff machinery only ever compares
// integers. Matching runs on Myers' O(ND) algorithm; the merge walk is the
// classic diff3 chunking over the two base-to-side alignments.
//
// Conflict hunks carry all three versions between stable markers, so a
// marked-up result can be post-processed without guessing region bounds.

use std::collections::HashMap;

pub const CONFLICT_LOCAL_MARKER: &str = "<<<<<<< local";
pub const CONFLICT_BASE_MARKER: &str = "||||||| base";
pub const CONFLICT_SEPARATOR: &str = "=======";
pub const CONFLICT_REMOTE_MARKER: &str = ">>>>>>> remote";

/// Result of a three-way text merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub text: String,
    /// Number of conflict hunks embedded in `text`.
    pub conflicts: usize,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts == 0
    }
}

/// Split into lines, keeping each line's terminator so the merged output
/// reproduces the inputs byte-exactly outside changed regions.
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split_inclusive('\n').collect();
    if text.is_empty() {
        lines.clear();
    }
    lines
}

/// Intern lines of all three inputs into one shared code space.
struct Interner<'a> {
    codes: HashMap<&'a str, u32>,
    lines: Vec<&'a str>,
}

impl<'a> Interner<'a> {
    fn new() -> Self {
        Interner {
            codes: HashMap::new(),
            lines: Vec::new(),
        }
    }

    fn intern(&mut self, text: &'a str) -> Vec<u32> {
        split_lines(text)
            .into_iter()
            .map(|line| {
                *self.codes.entry(line).or_insert_with(|| {
                    self.lines.push(line);
                    (self.lines.len() - 1) as u32
                })
            })
            .collect()
    }

    fn resolve(&self, code: u32) -> &'a str {
        self.lines[code as usize]
    }
}

/// Matched index pairs of the longest common subsequence, via Myers.
fn lcs_matches(a: &[u32], b: &[u32]) -> Vec<(usize, usize)> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    if n == 0 || m == 0 {
        return Vec::new();
    }
    let max = n + m;
    let width = (2 * max + 1) as usize;
    let mut v = vec![0isize; width];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'outer: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + max) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'outer;
            }
            k += 2;
        }
    }

    // Walk the trace backwards, collecting snake diagonals as matches.
    let mut matches = Vec::new();
    let mut x = n;
    let mut y = m;
    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let prev_k = if k == -d || (k != d && v[(k - 1 + max) as usize] < v[(k + 1 + max) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + max) as usize];
        let prev_y = prev_x - prev_k;
        while x > prev_x && y > prev_y {
            matches.push(((x - 1) as usize, (y - 1) as usize));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            x = prev_x;
            y = prev_y;
        }
    }
    matches.reverse();
    matches
}

/// Map base index → side index for matched lines.
fn match_map(base: &[u32], side: &[u32]) -> Vec<Option<usize>> {
    let mut map = vec![None; base.len()];
    for (i, j) in lcs_matches(base, side) {
        map[i] = Some(j);
    }
    map
}

/// Three-way merge of `local` and `remote` against their common `base`.
pub fn merge(base: &str, local: &str, remote: &str) -> MergeResult {
    let mut interner = Interner::new();
    let base_codes = interner.intern(base);
    let local_codes = interner.intern(local);
    let remote_codes = interner.intern(remote);

    let ml = match_map(&base_codes, &local_codes);
    let mr = match_map(&base_codes, &remote_codes);

    let mut out = String::new();
    let mut conflicts = 0usize;

    let mut i = 0usize; // base cursor
    let mut il = 0usize; // local cursor
    let mut ir = 0usize; // remote cursor

    while i < base_codes.len() || il < local_codes.len() || ir < remote_codes.len() {
        let stable = i < base_codes.len()
            && il < local_codes.len()
            && ir < remote_codes.len()
            && ml[i] == Some(il)
            && mr[i] == Some(ir);
        if stable {
            out.push_str(interner.resolve(base_codes[i]));
            i += 1;
            il += 1;
            ir += 1;
            continue;
        }

        // Unstable region: scan to the next base line matched in both sides.
        let mut i2 = i;
        let (jl, jr) = loop {
            if i2 >= base_codes.len() {
                break (local_codes.len(), remote_codes.len());
            }
            if let (Some(jl), Some(jr)) = (ml[i2], mr[i2]) {
                if jl >= il && jr >= ir {
                    break (jl, jr);
                }
            }
            i2 += 1;
        };

        let base_region = &base_codes[i..i2];
        let local_region = &local_codes[il..jl];
        let remote_region = &remote_codes[ir..jr];

        if local_region == base_region {
            // Only the remote side touched this region.
            for &code in remote_region {
                out.push_str(interner.resolve(code));
            }
        } else if remote_region == base_region || local_region == remote_region {
            for &code in local_region {
                out.push_str(interner.resolve(code));
            }
        } else {
            conflicts += 1;
            emit_conflict(
                &mut out,
                &interner,
                base_region,
                local_region,
                remote_region,
            );
        }

        i = i2;
        il = jl;
        ir = jr;
    }

    MergeResult {
        text: out,
        conflicts,
    }
}

fn emit_conflict(
    out: &mut String,
    interner: &Interner<'_>,
    base: &[u32],
    local: &[u32],
    remote: &[u32],
) {
    // A conflict in the final unterminated region must not glue marker text
    // onto a content line.
    let push_region = |out: &mut String, codes: &[u32]| {
        for &code in codes {
            out.push_str(interner.resolve(code));
        }
        if codes
            .last()
            .map(|&c| !interner.resolve(c).ends_with('\n'))
            .unwrap_or(false)
        {
            out.push('\n');
        }
    };

    out.push_str(CONFLICT_LOCAL_MARKER);
    out.push('\n');
    push_region(out, local);
    out.push_str(CONFLICT_BASE_MARKER);
    out.push('\n');
    push_region(out, base);
    out.push_str(CONFLICT_SEPARATOR);
    out.push('\n');
    push_region(out, remote);
    out.push_str(CONFLICT_REMOTE_MARKER);
    out.push('\n');
}
