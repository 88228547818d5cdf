// Copyright 2024 Guanhao Yin <sopium@mysterious.site>

// This file is part of wgdash.

// wgdash is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// wgdash is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with wgdash.  If not, see <https://www.gnu.org/licenses/>.

//! Connection pattern shaping (`I1..I5`) of obfuscated tunnels.

pub mod adaptation;
pub mod format;
pub mod library;

pub use adaptation::{CpsAdaptation, CpsMetric, Patterns, Suggestion};
pub use library::{JsonPatternLibrary, LibraryPattern, PatternLibrary};
