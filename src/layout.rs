// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A named address-space region declared by `#LAYOUT`.

#[derive(Clone, Debug)]
pub struct Layout {
    pub name: String,
    pub start_addr: i64,
    pub end_addr: i64,
    pub rom_location: Option<i64>,
    pub banked: bool,
    pub bank_min: i64,
    pub bank_max: Option<i64>,
}

impl Layout {
    pub fn new(name: String, start_addr: i64, end_addr: i64) -> Self {
        Layout {
            name,
            start_addr,
            end_addr,
            rom_location: None,
            banked: false,
            bank_min: 0,
            bank_max: None,
        }
    }
}
