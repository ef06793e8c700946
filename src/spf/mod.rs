//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailauth.
//
// Mailauth is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailauth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailauth. If not, see <http://www.gnu.org/licenses/>.


//! Sender Policy Framework (RFC 7208).
//!
//! `syntax` parses records, `eval` decides a result from whatever DNS records
//! are already known, and `spf_verify` drives the whole process against a
//! `Resolver`.

mod driver;
mod eval;
pub mod macros;
pub mod syntax;

pub use driver::{run, spf_verify, Verdict, VerifyOptions};
pub use eval::{eval, Context, Evaluation, Explanation, SpfResult};
