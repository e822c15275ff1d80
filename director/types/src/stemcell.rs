// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stemcells: the base VM images instances boot from.

use serde::{Deserialize, Serialize};

/// One uploaded stemcell build, scoped to a CPI in multi-CPI deployments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellModel {
    pub name: String,
    pub operating_system: String,
    pub version: String,
    pub cpi: Option<String>,
}

/// The stemcell an instance group asks for, together with the uploaded
/// builds that satisfy it across CPIs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stemcell {
    pub name: String,
    pub os: String,
    pub version: String,
    pub models: Vec<StemcellModel>,
}

impl Stemcell {
    /// The uploaded build an instance should be compared against and booted
    /// from.
    ///
    /// When the instance's availability zone binds a CPI, the build is
    /// looked up by (os, version, cpi); the *name* is unique per CPI
    /// (e.g. contains "vsphere") and would never match across providers.
    /// With no CPI bound, or no CPI-scoped build uploaded, this falls back
    /// to the first build, preserving single-CPI behavior.
    pub fn model_for_cpi(&self, cpi: Option<&str>) -> Option<&StemcellModel> {
        let fallback = self.models.first();
        let Some(cpi) = cpi else {
            return fallback;
        };
        self.models
            .iter()
            .find(|model| {
                model.cpi.as_deref() == Some(cpi)
                    && model.operating_system == self.os
                    && model.version == self.version
            })
            .or(fallback)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stemcell() -> Stemcell {
        Stemcell {
            name: "bosh-aws-xen-ubuntu-jammy".to_string(),
            os: "ubuntu-jammy".to_string(),
            version: "1.13".to_string(),
            models: vec![
                StemcellModel {
                    name: "bosh-aws-xen-ubuntu-jammy".to_string(),
                    operating_system: "ubuntu-jammy".to_string(),
                    version: "1.13".to_string(),
                    cpi: Some("aws-east".to_string()),
                },
                StemcellModel {
                    name: "bosh-vsphere-esxi-ubuntu-jammy".to_string(),
                    operating_system: "ubuntu-jammy".to_string(),
                    version: "1.13".to_string(),
                    cpi: Some("vsphere-dc1".to_string()),
                },
            ],
        }
    }

    #[test]
    fn test_cpi_scoped_resolution() {
        let stemcell = stemcell();
        let model = stemcell.model_for_cpi(Some("vsphere-dc1")).unwrap();
        assert_eq!(model.name, "bosh-vsphere-esxi-ubuntu-jammy");
    }

    #[test]
    fn test_no_cpi_falls_back_to_first_build() {
        let stemcell = stemcell();
        let model = stemcell.model_for_cpi(None).unwrap();
        assert_eq!(model.name, "bosh-aws-xen-ubuntu-jammy");
    }

    #[test]
    fn test_unknown_cpi_falls_back_to_first_build() {
        let stemcell = stemcell();
        let model = stemcell.model_for_cpi(Some("gcp")).unwrap();
        assert_eq!(model.name, "bosh-aws-xen-ubuntu-jammy");
    }
}
