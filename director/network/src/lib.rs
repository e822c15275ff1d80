// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flotilla director's network model.
//!
//! Three layers, leaf to root:
//!
//! * the topology ([`network`], [`subnet`]): manual, dynamic, and VIP
//!   networks parsed and validated up front, before any instance planning;
//! * the reservation system ([`reservation`], [`ip_provider`]): binding
//!   instances to concrete addresses against that topology;
//! * addressing ([`settings`], [`dns`]): turning resolved reservations
//!   into the settings blob an agent consumes and the single preferred
//!   address an instance or link consumer should use.
//!
//! Everything here is synchronous and deterministic: given the same
//! topology and the same sequence of reservation requests, the same
//! addresses come out.  The planning layer provides the single allocation
//! authority that serializes those requests.

pub mod dns;
pub mod errors;
pub mod ip_provider;
pub mod network;
pub mod reservation;
pub mod settings;
pub mod subnet;

pub use errors::{AllocationError, TopologyError};
pub use network::{Network, NetworkKind};
pub use reservation::{Reservation, ReservationKind};
