// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-space bookkeeping for each [`Layout`], including on-demand
//! bank growth.
//!
//! Free space is tracked as a flat list of `(bank, start, end)`
//! intervals; there is no attempt to keep it sorted or coalesced
//! since layouts only ever shrink intervals from allocation, never
//! merge them back.

use std::collections::HashMap;

use crate::error::{AssemblerError, Result};
use crate::layout::Layout;

struct Interval {
    bank: Option<i64>,
    start: i64,
    end: i64,
}

pub struct SpaceAllocationInfo {
    layout: Layout,
    available: Vec<Interval>,
    next_free_bank: Option<i64>,
}

impl SpaceAllocationInfo {
    pub fn new(layout: Layout) -> Self {
        let (available, next_free_bank) = if layout.banked {
            (
                vec![Interval { bank: Some(layout.bank_min), start: layout.start_addr, end: layout.end_addr }],
                Some(layout.bank_min + 1),
            )
        } else {
            (vec![Interval { bank: None, start: layout.start_addr, end: layout.end_addr }], None)
        };
        SpaceAllocationInfo { layout, available, next_free_bank }
    }

    pub fn free_space(&self) -> Vec<(Option<i64>, i64)> {
        let mut per_bank: Vec<(Option<i64>, i64)> = Vec::new();
        for iv in &self.available {
            if let Some(entry) = per_bank.iter_mut().find(|(b, _)| *b == iv.bank) {
                entry.1 += iv.end - iv.start;
            } else {
                per_bank.push((iv.bank, iv.end - iv.start));
            }
        }
        per_bank
    }

    pub fn total_space(&self) -> i64 {
        self.layout.end_addr - self.layout.start_addr
    }

    pub fn allocate_fixed(&mut self, start: i64, length: i64, bank: Option<i64>) -> Result<Option<i64>> {
        if let Some(b) = bank {
            while b >= self.next_free_bank.unwrap_or(i64::MAX) {
                self.new_bank()?;
            }
        }
        let end = start + length;
        for idx in 0..self.available.len() {
            let iv = &self.available[idx];
            if bank.is_some() && iv.bank != bank {
                continue;
            }
            if iv.start <= start && iv.end >= end {
                let (b, s, e) = (iv.bank, iv.start, iv.end);
                self.available.remove(idx);
                if s < start {
                    self.available.push(Interval { bank: b, start: s, end: start });
                }
                if e > end {
                    self.available.push(Interval { bank: b, start: end, end: e });
                }
                return Ok(b);
            }
        }
        Err(AssemblerError::bare(format!(
            "Failed to allocate fixed region: {start:04x}-{end:04x} in bank {bank:?}"
        )))
    }

    pub fn allocate(&mut self, length: i64, bank: Option<i64>) -> Result<(Option<i64>, i64)> {
        if let Some(b) = bank {
            while b >= self.next_free_bank.unwrap_or(i64::MAX) {
                self.new_bank()?;
            }
        }
        for idx in 0..self.available.len() {
            let iv = &self.available[idx];
            if bank.is_some() && iv.bank != bank {
                continue;
            }
            let size = iv.end - iv.start;
            if size >= length {
                let (b, s, e) = (iv.bank, iv.start, iv.end);
                if size > length {
                    self.available[idx] = Interval { bank: b, start: s + length, end: e };
                } else {
                    self.available.remove(idx);
                }
                return Ok((b, s));
            }
        }
        if bank.is_some() || !self.layout.banked {
            return Err(AssemblerError::bare(format!("Failed to allocate region: {length:04x}")));
        }
        self.new_bank()?;
        self.allocate(length, bank)
    }

    fn new_bank(&mut self) -> Result<()> {
        let next = self.next_free_bank.expect("new_bank called on an unbanked layout");
        if self.layout.bank_max == Some(next) {
            return Err(AssemblerError::bare(format!(
                "Ran out of available banks for {}",
                self.layout.name
            )));
        }
        self.available.push(Interval { bank: Some(next), start: self.layout.start_addr, end: self.layout.end_addr });
        self.next_free_bank = Some(next + 1);
        Ok(())
    }
}

pub struct SpaceAllocator {
    data: HashMap<String, SpaceAllocationInfo>,
}

impl SpaceAllocator {
    pub fn new(layouts: HashMap<String, Layout>) -> Self {
        let data = layouts
            .into_iter()
            .map(|(name, layout)| (name, SpaceAllocationInfo::new(layout)))
            .collect();
        SpaceAllocator { data }
    }

    pub fn dump_free_space(&self) {
        println!("\nFree space:");
        for (name, sai) in &self.data {
            let mut spaces = sai.free_space();
            spaces.sort_by_key(|(bank, _)| *bank);
            for (bank, free) in spaces {
                let total = sai.total_space();
                if free < total {
                    let bank_str = bank.map(|b| format!("{b:02x}")).unwrap_or_default();
                    let pct = free as f64 / total as f64 * 100.0;
                    println!("  {name:5}{bank_str:>5} {free:5}/{total:<5} ({pct:.1}%)");
                }
            }
        }
    }

    pub fn allocate_fixed(&mut self, section_type: &str, start: i64, length: i64, bank: Option<i64>) -> Result<Option<i64>> {
        self.data
            .get_mut(section_type)
            .ok_or_else(|| AssemblerError::bare(format!("Unknown layout: {section_type}")))?
            .allocate_fixed(start, length, bank)
    }

    pub fn allocate(&mut self, section_type: &str, length: i64, bank: Option<i64>) -> Result<(Option<i64>, i64)> {
        self.data
            .get_mut(section_type)
            .ok_or_else(|| AssemblerError::bare(format!("Unknown layout: {section_type}")))?
            .allocate(length, bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        let mut l = Layout::new("ROM0".into(), 0x4000, 0x8000);
        l.banked = true;
        l.bank_min = 1;
        l.bank_max = Some(4);
        l
    }

    #[test]
    fn allocate_fixed_splits_around_request() {
        let mut sai = SpaceAllocationInfo::new(layout());
        let bank = sai.allocate_fixed(0x4100, 0x10, Some(1)).unwrap();
        assert_eq!(bank, Some(1));
        let free = sai.free_space();
        let total: i64 = free.iter().map(|(_, n)| n).sum();
        assert_eq!(total, (0x8000 - 0x4000) - 0x10);
    }

    #[test]
    fn allocate_grows_a_new_bank_on_demand() {
        let mut sai = SpaceAllocationInfo::new(layout());
        sai.allocate(0x4000 - 1, Some(1)).unwrap();
        let (bank, _) = sai.allocate(0x10, None).unwrap();
        assert_eq!(bank, Some(2));
    }

    #[test]
    fn bank_max_is_enforced() {
        let mut l = layout();
        l.bank_max = Some(2);
        let mut sai = SpaceAllocationInfo::new(l);
        sai.allocate(0x4000 - 1, Some(1)).unwrap();
        assert!(sai.allocate(0x10, None).is_err());
    }
}
