// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use honggfuzz::fuzz;
    use otarecovery::package::{compat, keystore};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = compat::read_compatibility_fragments(Cursor::new(data));
                let _ = keystore::load_trusted_certs_from_reader(Cursor::new(data));
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
