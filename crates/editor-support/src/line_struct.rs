//! Original/current line renumbering.
//!
//! A [`LineStruct`] remembers how the lines of a snapshot ("original" numbering) relate to the
//! lines of the live document ("current" numbering) after lines have been inserted and
//! removed. The state is an ordered list of [`Info`] runs: unchanged runs map one-to-one,
//! inserted runs exist only in the current numbering and removed runs only in the original.
//!
//! The list always ends with an unchanged run of [`MAX`] lines, so lines past every recorded
//! edit map with the accumulated shift.

/// Length of the trailing unchanged run ("all remaining lines").
pub const MAX: usize = usize::MAX / 4;

/// Kind of a run of lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    /// Lines present in both numberings.
    Original,
    /// Lines present only in the current numbering.
    Inserted,
    /// Lines present only in the original numbering.
    Removed,
}

/// A run of lines: how many it spans in each numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    /// Lines spanned in the original numbering.
    pub original: usize,
    /// Lines spanned in the current numbering.
    pub current: usize,
}

impl Info {
    /// An unchanged run.
    pub const fn original(count: usize) -> Self {
        Self {
            original: count,
            current: count,
        }
    }

    /// An inserted run.
    pub const fn inserted(count: usize) -> Self {
        Self {
            original: 0,
            current: count,
        }
    }

    /// A removed run.
    pub const fn removed(count: usize) -> Self {
        Self {
            original: count,
            current: 0,
        }
    }

    /// Classify the run.
    pub fn kind(&self) -> AreaKind {
        if self.original == self.current {
            AreaKind::Original
        } else if self.original == 0 {
            AreaKind::Inserted
        } else if self.current == 0 {
            AreaKind::Removed
        } else {
            unreachable!("mixed line run {:?}", self)
        }
    }

    fn is_empty(&self) -> bool {
        self.original == 0 && self.current == 0
    }
}

/// Line renumbering state of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineStruct {
    list: Vec<Info>,
}

impl Default for LineStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl LineStruct {
    /// A structure with no recorded edits.
    pub fn new() -> Self {
        Self {
            list: vec![Info::original(MAX)],
        }
    }

    /// The runs, trailing [`MAX`] run included.
    pub fn intervals(&self) -> &[Info] {
        &self.list
    }

    /// Whether no edit has been recorded (or all recorded edits cancelled out).
    pub fn is_identity(&self) -> bool {
        self.list.len() == 1
    }

    /// Translate `line` between numberings.
    ///
    /// With `current_to_original`, an inserted line maps to the original line that follows the
    /// insertion point. Otherwise a removed original line maps to the current line that now
    /// occupies its place.
    pub fn convert(&self, line: usize, current_to_original: bool) -> usize {
        let mut original = 0;
        let mut current = 0;

        for info in &self.list {
            if current_to_original {
                if info.current > 0 && line < current + info.current {
                    return match info.kind() {
                        AreaKind::Original => original + (line - current),
                        _ => original,
                    };
                }
            } else if info.original > 0 && line < original + info.original {
                return match info.kind() {
                    AreaKind::Original => current + (line - original),
                    _ => current,
                };
            }
            original += info.original;
            current += info.current;
        }

        if current_to_original {
            original + line.saturating_sub(current)
        } else {
            current + line.saturating_sub(original)
        }
    }

    /// Record that `count` lines were inserted so that the first of them is current line `at`.
    pub fn insert_lines(&mut self, at: usize, count: usize) {
        if count == 0 {
            return;
        }

        let (idx, base) = self.find_current(at);
        let offset = at - base;
        let info = self.list[idx];

        match info.kind() {
            AreaKind::Inserted => self.list[idx].current += count,
            AreaKind::Original if offset == 0 => {
                if idx > 0 && self.list[idx - 1].kind() == AreaKind::Inserted {
                    self.list[idx - 1].current += count;
                } else {
                    self.list.insert(idx, Info::inserted(count));
                }
            }
            AreaKind::Original => {
                let rest = info.original - offset;
                self.list.splice(
                    idx..=idx,
                    [
                        Info::original(offset),
                        Info::inserted(count),
                        Info::original(rest),
                    ],
                );
            }
            AreaKind::Removed => unreachable!("lookup by current line returned a removed run"),
        }

        self.normalize();
    }

    /// Record that `count` current lines starting at current line `at` were removed.
    pub fn delete_lines(&mut self, at: usize, count: usize) {
        if count == 0 {
            return;
        }

        let (mut idx, base) = self.find_current(at);
        let mut offset = at - base;
        let mut remaining = count;

        while remaining > 0 && idx < self.list.len() {
            let info = self.list[idx];
            match info.kind() {
                AreaKind::Removed => idx += 1,
                AreaKind::Inserted => {
                    let take = (info.current - offset).min(remaining);
                    self.list[idx].current -= take;
                    remaining -= take;
                    if self.list[idx].current == 0 {
                        self.list.remove(idx);
                    } else {
                        idx += 1;
                    }
                }
                AreaKind::Original => {
                    let available = info.current - offset;
                    let take = available.min(remaining);
                    let mut replacement = Vec::with_capacity(3);
                    if offset > 0 {
                        replacement.push(Info::original(offset));
                    }
                    replacement.push(Info::removed(take));
                    if available > take {
                        replacement.push(Info::original(available - take));
                    }
                    let inserted = replacement.len();
                    self.list.splice(idx..=idx, replacement);
                    idx += inserted;
                    remaining -= take;
                }
            }
            offset = 0;
        }

        self.normalize();
    }

    /// Index of the first run holding current line `at`, and the current line it starts at.
    fn find_current(&mut self, at: usize) -> (usize, usize) {
        let mut current = 0;
        for (idx, info) in self.list.iter().enumerate() {
            if info.current > 0 && at < current + info.current {
                return (idx, current);
            }
            current += info.current;
        }

        // Only reachable past MAX lines: grow the trailing run.
        let missing = at - current + 1;
        self.list.push(Info::original(missing.max(MAX)));
        (self.list.len() - 1, current)
    }

    fn normalize(&mut self) {
        let mut merged: Vec<Info> = Vec::with_capacity(self.list.len());
        for info in self.list.drain(..) {
            if info.is_empty() {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.kind() == info.kind() {
                    last.original += info.original;
                    last.current += info.current;
                    continue;
                }
            }
            merged.push(info);
        }
        self.list = merged;
    }
}
