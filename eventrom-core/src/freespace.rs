use serde::Serialize;
use tracing::{debug, warn};

use crate::{Result, RomError};

/// Free/used classification over `[0, len)`.
///
/// The map is stored as the list of internal offsets where the class flips.
/// Segment `k` spans `[bounds[k-1], bounds[k])` (with `0` and `len` as the outer
/// edges) and is free when `first_free` differs from `k` being odd. The list is
/// kept canonical: no two neighbouring segments share a class and no segment is
/// empty, so identical classifications always have identical bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeSpace {
    len: usize,
    bank_size: usize,
    first_free: bool,
    bounds: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub free: bool,
}

impl FreeSpace {
    /// A map of `len` bytes, all used.
    pub fn new(len: usize, bank_size: usize) -> Self {
        FreeSpace {
            len,
            bank_size: bank_size.max(1),
            first_free: false,
            bounds: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    fn segment_index(&self, offset: usize) -> usize {
        self.bounds.partition_point(|&b| b <= offset)
    }

    fn class_of(&self, segment: usize) -> bool {
        self.first_free ^ (segment % 2 == 1)
    }

    pub fn is_free(&self, offset: usize) -> bool {
        offset < self.len && self.class_of(self.segment_index(offset))
    }

    /// Start and end of the segment containing `offset`.
    fn segment_span(&self, segment: usize) -> (usize, usize) {
        let start = if segment == 0 { 0 } else { self.bounds[segment - 1] };
        let end = self.bounds.get(segment).copied().unwrap_or(self.len);
        (start, end)
    }

    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        let count = if self.len == 0 { 0 } else { self.bounds.len() + 1 };
        (0..count).map(move |k| {
            let (start, end) = self.segment_span(k);
            Segment {
                start,
                end,
                free: self.class_of(k),
            }
        })
    }

    pub fn free_bytes(&self) -> usize {
        self.segments()
            .filter(|s| s.free)
            .map(|s| s.end - s.start)
            .sum()
    }

    pub fn used_bytes(&self) -> usize {
        self.len - self.free_bytes()
    }

    /// Reclassifies `[start, end)`. Ranges running past the end are clamped.
    pub fn mark(&mut self, start: usize, end: usize, free: bool) -> Result<()> {
        let clamped_end = end.min(self.len);
        if clamped_end != end {
            warn!(
                "clamping range [{:#X}, {:#X}) to image end {:#X}",
                start, end, self.len
            );
        }
        if start >= clamped_end {
            return Err(RomError::InvalidRange { start, end });
        }
        let end = clamped_end;

        let keep_start = start > 0 && self.is_free(start - 1) != free;
        let keep_end = end < self.len && self.is_free(end) != free;

        let lo = self.bounds.partition_point(|&b| b < start);
        let hi = self.bounds.partition_point(|&b| b <= end);

        let mut replacement = Vec::with_capacity(2);
        if keep_start {
            replacement.push(start);
        }
        if keep_end {
            replacement.push(end);
        }

        if start == 0 {
            self.first_free = free;
        }
        self.bounds.splice(lo..hi, replacement);
        Ok(())
    }

    pub fn mark_free(&mut self, start: usize, end: usize) -> Result<()> {
        self.mark(start, end, true)
    }

    pub fn mark_used(&mut self, start: usize, end: usize) -> Result<()> {
        self.mark(start, end, false)
    }

    /// Grows the tracked length to `new_end`, classifying the new tail.
    pub fn extend_end(&mut self, new_end: usize, free: bool) {
        if new_end <= self.len {
            return;
        }
        if self.len == 0 {
            self.first_free = free;
        } else if self.is_free(self.len - 1) != free {
            self.bounds.push(self.len);
        }
        self.len = new_end;
    }

    fn crosses_bank(&self, offset: usize, size: usize) -> bool {
        offset % self.bank_size + size > self.bank_size
    }

    /// First free offset at or after `hint` where `size` bytes fit without
    /// crossing a bank boundary. Nothing is marked.
    pub fn find_free(&self, size: usize, hint: usize) -> Result<usize> {
        if size == 0 {
            return Err(RomError::InvalidArgument(
                "cannot allocate an empty region".to_string(),
            ));
        }
        if size > self.bank_size || hint >= self.len {
            return Err(RomError::OutOfSpace { size });
        }

        let first = self.segment_index(hint);
        for k in first..=self.bounds.len() {
            if !self.class_of(k) {
                continue;
            }
            let (seg_start, seg_end) = self.segment_span(k);
            let mut candidate = seg_start.max(hint);
            if self.crosses_bank(candidate, size) {
                candidate = (candidate / self.bank_size + 1) * self.bank_size;
            }
            if candidate + size <= seg_end {
                return Ok(candidate);
            }
        }

        Err(RomError::OutOfSpace { size })
    }

    /// Finds one region per entry of `sizes`, all inside a single bank.
    /// Offsets are returned in the order of `sizes`. Nothing is marked.
    pub fn find_free_same_bank(&mut self, sizes: &[usize]) -> Result<Vec<usize>> {
        if sizes.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<usize> = (0..sizes.len()).collect();
        order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]));

        let largest = sizes[order[0]];
        let mut hint = 0;
        while hint < self.len {
            let first = self.find_free(largest, hint)?;
            let bank = first / self.bank_size;

            let mut placed: Vec<(usize, usize)> = Vec::with_capacity(sizes.len());
            placed.push((first, largest));
            self.mark_used(first, first + largest)?;

            let mut ok = true;
            for &idx in &order[1..] {
                let size = sizes[idx];
                match self.find_free(size, bank * self.bank_size) {
                    Ok(offset) if offset / self.bank_size == bank => {
                        self.mark_used(offset, offset + size)?;
                        placed.push((offset, size));
                    }
                    _ => {
                        ok = false;
                        break;
                    }
                }
            }

            for &(offset, size) in &placed {
                self.mark_free(offset, offset + size)?;
            }

            if ok {
                let mut result = vec![0; sizes.len()];
                for (slot, &idx) in order.iter().enumerate() {
                    result[idx] = placed[slot].0;
                }
                debug!("same-bank placement {:X?} for sizes {:?}", result, sizes);
                return Ok(result);
            }

            hint = (bank + 1) * self.bank_size;
        }

        Err(RomError::NoSharedBank {
            sizes: sizes.to_vec(),
        })
    }
}
