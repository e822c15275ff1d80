// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common functionality shared across the flotilla director.
//!
//! Right now this is limited to IP addressing arithmetic.  The network model
//! and the reservation system both need to agree on what a range of
//! addresses is and how to walk one, so that logic lives here rather than in
//! either of them.

pub mod address;
