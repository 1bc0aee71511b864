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


//! Decrypted content handling
//!
//! Once a title is decrypted its plaintext must reach the viewer without
//! ever touching shared storage, and it must vanish the moment the session
//! ends. The `ContentSink` trait carries that guarantee; implementations
//! differ by platform capability (private session directory vs in-memory),
//! never by conditionals in the DRM flow.

pub mod sink;

pub use sink::{ContentHandle, ContentSink, MemorySink, SessionDirSink};
