// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Device identity and key material
//!
//! Licenses issued by the server are bound to one installation of the app.
//! This module owns the two halves of that binding:
//!
//! - `DeviceIdentity` derives and persists the stable device fingerprint the
//!   server records with every license.
//! - `KeyVault` generates and persists the RSA keypair whose public half the
//!   server wraps content keys against.
//!
//! Both are explicitly constructed services over a `ProtectedStore`; nothing
//! here is a process-wide singleton, so tests substitute fixed attributes and
//! deterministic stores freely.

pub mod identity;
pub mod vault;

pub use identity::{
    AttributeSource, DeviceAttributes, DeviceIdentity, PlatformAttributes, StaticAttributes,
};
pub use vault::{DeviceKeyPair, KeyVault};
