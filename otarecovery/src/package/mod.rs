// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod compat;
pub mod keystore;
pub mod verify;
