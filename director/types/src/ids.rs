// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed identifiers for the entities in the fleet arena.
//!
//! Records reference one another by id, never by owning pointer, so a typed
//! wrapper per entity kind keeps an instance id from being used where a VM
//! id was meant.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! typed_uuid {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_untyped_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn into_untyped_uuid(self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_uuid!(InstanceUuid, "Stable id of a managed instance");
typed_uuid!(VmUuid, "Id of a VM record (one underlying virtual machine)");
typed_uuid!(DiskUuid, "Id of a persistent disk record");
typed_uuid!(VariableSetId, "Version pointer into the variable store");
