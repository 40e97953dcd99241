// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use honggfuzz::fuzz;
    use otarecovery::package::verify::SignedPackage;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                // Covers both the footer/EOCD locator and the CMS decoder.
                let _ = SignedPackage::new(Cursor::new(data));
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
