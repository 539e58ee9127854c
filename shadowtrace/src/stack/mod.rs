// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread shadow call stacks.
//!
//! A shadow stack is a bounded text trail of "currently executing" frames,
//! maintained without relying on the real CPU stack, so a crash harvest can
//! read it even when unwinding would be unsafe. The arena is allocated once
//! at thread registration; push and pop never allocate and never fail.

pub mod tls;

use crate::shared::constants::{
    ST_FRAME_OVERHEAD, ST_FRAME_PLACEHOLDER, ST_LINE_PLACEHOLDER, ST_MAX_FRAME_TEXT,
    ST_STACK_CAPACITY,
};
use std::fmt::{self, Write};

/// One typed argument of a shadow frame.
///
/// The set of types is closed so that formatting is machine-checkable and
/// cannot fail the way a stray format string could.
#[derive(Debug, Clone, Copy)]
pub enum FrameArg<'a> {
    Str(&'a str),
    Int(i64),
    Uint(u64),
    /// Rendered as 0x-prefixed hexadecimal, for addresses and flags.
    Hex(u64),
    Float(f64),
    Char(char),
}

impl FrameArg<'_> {
    fn write_to(&self, w: &mut SlotWriter<'_>) -> fmt::Result {
        match self {
            FrameArg::Str(s) => w.write_str(s),
            FrameArg::Int(v) => write!(w, "{v}"),
            FrameArg::Uint(v) => write!(w, "{v}"),
            FrameArg::Hex(v) => write!(w, "{v:#x}"),
            FrameArg::Float(v) => write!(w, "{v}"),
            FrameArg::Char(c) => w.write_char(*c),
        }
    }
}

/// Formats into a fixed slot, truncating on overflow instead of erroring.
/// Interior NUL bytes are replaced because the arena framing is
/// NUL-terminated.
struct SlotWriter<'a> {
    slot: &'a mut [u8],
    len: usize,
}

impl Write for SlotWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.slot.len() - self.len;
        let mut cut = s.len().min(room);
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        for &byte in &s.as_bytes()[..cut] {
            self.slot[self.len] = if byte == 0 { b'?' } else { byte };
            self.len += 1;
        }
        Ok(())
    }
}

fn format_frame(slot: &mut [u8], name: &str, args: &[FrameArg<'_>]) -> Result<usize, fmt::Error> {
    let mut writer = SlotWriter { slot, len: 0 };
    writer.write_str(name)?;
    if !args.is_empty() {
        writer.write_str("(")?;
        for (index, arg) in args.iter().enumerate() {
            if index > 0 {
                writer.write_str(", ")?;
            }
            arg.write_to(&mut writer)?;
        }
        writer.write_str(")")?;
    }
    Ok(writer.len)
}

/// A bounded, allocation-free trail of diagnostic frames for one thread.
///
/// Arena layout, repeated per retained frame:
///
/// ```text
/// <formatted bytes> <NUL> <u16 little-endian self-length>
/// ```
///
/// The self-length counts the formatted bytes plus the NUL, which makes the
/// most recent frame removable in O(1) by reading two bytes behind the write
/// cursor.
pub struct ShadowStack {
    buf: Box<[u8]>,
    end: usize,
    skipped: u32,
    iter_pos: usize,
    underflows: u32,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self::with_capacity(ST_STACK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity >= ST_MAX_FRAME_TEXT + ST_FRAME_OVERHEAD);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            end: 0,
            skipped: 0,
            iter_pos: 0,
            underflows: 0,
        }
    }

    /// Appends one formatted frame. When the arena cannot hold a worst-case
    /// frame the push is counted in `skipped` and nothing else changes; the
    /// buffer never grows here. A frame that fails to format is replaced by
    /// a placeholder and still occupies a slot, so pops stay balanced.
    pub fn push(&mut self, name: &str, args: &[FrameArg<'_>]) {
        if self.buf.len() - self.end < ST_MAX_FRAME_TEXT + ST_FRAME_OVERHEAD {
            self.skipped = self.skipped.saturating_add(1);
            return;
        }

        let slot = &mut self.buf[self.end..self.end + ST_MAX_FRAME_TEXT];
        let text_len = match format_frame(slot, name, args) {
            Ok(len) if len > 0 => len,
            _ => {
                let placeholder = ST_FRAME_PLACEHOLDER.as_bytes();
                slot[..placeholder.len()].copy_from_slice(placeholder);
                placeholder.len()
            }
        };

        let nul_at = self.end + text_len;
        self.buf[nul_at] = 0;
        let stored = (text_len + 1) as u16;
        self.buf[nul_at + 1..nul_at + 3].copy_from_slice(&stored.to_le_bytes());
        self.end = nul_at + 3;
    }

    /// Removes the most recent frame. If the matching push was dropped for
    /// lack of room, the skip counter absorbs the pop instead. Popping an
    /// empty, non-skipped stack is a logic error in the caller's
    /// bracketing; it is counted and reported, never fatal.
    pub fn pop(&mut self) {
        if self.skipped > 0 {
            self.skipped -= 1;
            return;
        }
        if self.end == 0 {
            self.underflows = self.underflows.saturating_add(1);
            tracing::debug!("shadow stack pop with no retained frames");
            return;
        }
        let stored =
            u16::from_le_bytes([self.buf[self.end - 2], self.buf[self.end - 1]]) as usize;
        debug_assert!(stored >= 1 && stored + 2 <= self.end, "corrupt frame length");
        self.end = self.end.saturating_sub(stored + 2);
        if self.iter_pos > self.end {
            self.iter_pos = self.end;
        }
    }

    /// Yields the next retained frame between the last reset position and
    /// the current write cursor, in push order. The cursor is
    /// non-restartable: once it reaches the write cursor it stays exhausted
    /// until [`Self::reset_iteration`].
    pub fn next_line(&mut self) -> Option<&str> {
        if self.iter_pos >= self.end {
            return None;
        }
        let start = self.iter_pos;
        let text_end = match self.buf[start..self.end].iter().position(|&b| b == 0) {
            Some(offset) => start + offset,
            None => {
                // Unterminated tail can only mean arena corruption; park the
                // cursor at the end rather than looping.
                self.iter_pos = self.end;
                return Some(ST_LINE_PLACEHOLDER);
            }
        };
        self.iter_pos = text_end + ST_FRAME_OVERHEAD;
        match std::str::from_utf8(&self.buf[start..text_end]) {
            Ok(text) => Some(text),
            Err(_) => Some(ST_LINE_PLACEHOLDER),
        }
    }

    pub fn reset_iteration(&mut self) {
        self.iter_pos = 0;
    }

    /// Write-cursor position, the round-trip invariant of push/pop pairs.
    pub fn cursor(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    pub fn underflows(&self) -> u32 {
        self.underflows
    }

    /// Number of retained frames, by walking the arena. Report-generation
    /// only; the hot path never needs it.
    pub fn frame_count(&self) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while pos < self.end {
            match self.buf[pos..self.end].iter().position(|&b| b == 0) {
                Some(offset) => pos += offset + ST_FRAME_OVERHEAD,
                None => break,
            }
            count += 1;
        }
        count
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShadowStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowStack")
            .field("capacity", &self.buf.len())
            .field("end", &self.end)
            .field("skipped", &self.skipped)
            .field("frames", &self.frame_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(stack: &mut ShadowStack) -> Vec<String> {
        stack.reset_iteration();
        let mut lines = Vec::new();
        while let Some(line) = stack.next_line() {
            lines.push(line.to_string());
        }
        lines
    }

    #[test]
    fn push_formats_name_and_args() {
        let mut stack = ShadowStack::new();
        stack.push("OpenFile", &[FrameArg::Str("a.txt")]);
        stack.push("ReadBytes", &[FrameArg::Uint(100)]);
        stack.push(
            "Seek",
            &[FrameArg::Int(-12), FrameArg::Hex(0xdead), FrameArg::Char('r')],
        );
        assert_eq!(
            drain(&mut stack),
            vec!["OpenFile(a.txt)", "ReadBytes(100)", "Seek(-12, 0xdead, r)"]
        );
    }

    #[test]
    fn matched_push_pop_round_trips_the_cursor() {
        let mut stack = ShadowStack::new();
        let baseline = stack.cursor();
        for round in 0..10 {
            stack.push("Outer", &[FrameArg::Int(round)]);
            stack.push("Inner", &[]);
            stack.pop();
            stack.pop();
        }
        assert_eq!(stack.cursor(), baseline);
        assert!(stack.is_empty());
        assert_eq!(stack.underflows(), 0);
    }

    #[test]
    fn full_arena_drops_and_counts_instead_of_growing() {
        // Room for two 8-byte frames ("KeptA" + NUL + length) on top of one
        // worst-case reservation; the third push finds less than the
        // reservation free and must be dropped.
        let mut stack =
            ShadowStack::with_capacity(ST_MAX_FRAME_TEXT + ST_FRAME_OVERHEAD + 8);
        stack.push("KeptA", &[]);
        stack.push("KeptB", &[]);
        let cursor_when_full = stack.cursor();
        stack.push("Dropped", &[]);
        assert_eq!(stack.cursor(), cursor_when_full);
        assert_eq!(stack.skipped(), 1);

        // The pop matching the dropped push consumes the skip, not a frame.
        stack.pop();
        assert_eq!(stack.skipped(), 0);
        assert_eq!(stack.cursor(), cursor_when_full);
        assert_eq!(drain(&mut stack), vec!["KeptA", "KeptB"]);
    }

    #[test]
    fn iteration_is_not_restartable_without_reset() {
        let mut stack = ShadowStack::new();
        stack.push("First", &[]);
        stack.push("Second", &[]);
        assert_eq!(stack.next_line(), Some("First"));
        assert_eq!(stack.next_line(), Some("Second"));
        assert_eq!(stack.next_line(), None);
        // Exhausted stays exhausted.
        assert_eq!(stack.next_line(), None);
        stack.reset_iteration();
        assert_eq!(stack.next_line(), Some("First"));
    }

    #[test]
    fn iteration_resumes_from_last_position_after_new_pushes() {
        let mut stack = ShadowStack::new();
        stack.push("First", &[]);
        assert_eq!(stack.next_line(), Some("First"));
        assert_eq!(stack.next_line(), None);
        stack.push("Second", &[]);
        // The cursor was left at the old end, so only the new frame shows.
        assert_eq!(stack.next_line(), Some("Second"));
    }

    #[test]
    fn pop_on_empty_is_counted_not_fatal() {
        let mut stack = ShadowStack::new();
        stack.pop();
        stack.pop();
        assert_eq!(stack.underflows(), 2);
        stack.push("StillWorks", &[]);
        assert_eq!(drain(&mut stack), vec!["StillWorks"]);
    }

    #[test]
    fn oversized_frame_is_truncated_not_lost() {
        let mut stack = ShadowStack::new();
        let huge = "x".repeat(4 * ST_MAX_FRAME_TEXT);
        stack.push("Huge", &[FrameArg::Str(&huge)]);
        let lines = drain(&mut stack);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Huge(x"));
        assert!(lines[0].len() <= ST_MAX_FRAME_TEXT);
    }

    #[test]
    fn interior_nul_cannot_break_framing() {
        let mut stack = ShadowStack::new();
        stack.push("Name", &[FrameArg::Str("a\0b")]);
        stack.push("After", &[]);
        assert_eq!(drain(&mut stack), vec!["Name(a?b)", "After"]);
    }

    #[test]
    fn empty_name_becomes_placeholder() {
        let mut stack = ShadowStack::new();
        stack.push("", &[]);
        assert_eq!(drain(&mut stack), vec![ST_FRAME_PLACEHOLDER]);
        // The placeholder frame still pops cleanly.
        stack.pop();
        assert!(stack.is_empty());
    }

    #[test]
    fn frame_count_walks_the_arena() {
        let mut stack = ShadowStack::new();
        assert_eq!(stack.frame_count(), 0);
        stack.push("A", &[]);
        stack.push("B", &[]);
        assert_eq!(stack.frame_count(), 2);
        stack.pop();
        assert_eq!(stack.frame_count(), 1);
    }
}
