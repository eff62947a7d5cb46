//! Shared-inverter grouping and proportional AC allocation.

use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent};
use crate::error::{EngineError, EngineResult};
use crate::models::PVArray;
use crate::services::power_service::{inverter_pdc0_from_dc_ac_ratio, pvwatts_ac};

/// Arrays feeding the same inverter, in configuration order.
#[derive(Debug)]
pub struct InverterGroup<'a> {
    pub id: String,
    pub members: Vec<&'a PVArray>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverterRating {
    pub pdc0_inv_w: f64,
    pub eta_inv_nom: f64,
    pub explicit: bool,
}

/// Group AC output and its split back onto members.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAllocation {
    pub group_pac_w: Vec<f64>,
    /// Per member, per timestamp
    pub member_pac_w: Vec<Vec<f64>>,
    pub member_share: Vec<Vec<f64>>,
}

/// Partition arrays by `inverter_group_id`; arrays without one stand alone.
pub fn group_arrays(arrays: &[PVArray]) -> Vec<InverterGroup<'_>> {
    let mut groups: Vec<InverterGroup<'_>> = Vec::new();
    for array in arrays {
        let key = array.group_key();
        match groups.iter_mut().find(|g| g.id == key) {
            Some(group) => group.members.push(array),
            None => groups.push(InverterGroup {
                id: key.to_string(),
                members: vec![array],
            }),
        }
    }
    groups
}

pub fn group_rating(site_id: &str, group: &InverterGroup<'_>) -> EngineResult<InverterRating> {
    let eta_inv_nom = group
        .members
        .iter()
        .map(|a| a.eta_inv_nom())
        .fold(f64::NEG_INFINITY, f64::max);

    let mut explicit: Vec<f64> = Vec::new();
    for rating in group.members.iter().filter_map(|a| a.inverter_pdc0_w()) {
        if !explicit.contains(&rating) {
            explicit.push(rating);
        }
    }
    match explicit.as_slice() {
        [] => {}
        [rating] => {
            return Ok(InverterRating {
                pdc0_inv_w: *rating,
                eta_inv_nom,
                explicit: true,
            });
        }
        _ => {
            explicit.sort_by(f64::total_cmp);
            return Err(EngineError::ConflictingInverterRating {
                site: site_id.to_string(),
                group: group.id.clone(),
                ratings: explicit,
            });
        }
    }

    let pdc0_total: f64 = group.members.iter().map(|a| a.pdc0_w()).sum();
    let max_ratio = group
        .members
        .iter()
        .map(|a| a.dc_ac_ratio())
        .fold(f64::NEG_INFINITY, f64::max);
    Ok(InverterRating {
        pdc0_inv_w: inverter_pdc0_from_dc_ac_ratio(pdc0_total, max_ratio, eta_inv_nom)?,
        eta_inv_nom,
        explicit: false,
    })
}

/// Run the inverter once on the summed member DC and split the AC back by DC share.
pub fn allocate_group_ac(
    member_pdc_w: &[&[f64]],
    rating: &InverterRating,
    debug: &dyn DebugCollector,
) -> GroupAllocation {
    let n = member_pdc_w.first().map_or(0, |p| p.len());
    let pdc_sum: Vec<f64> = (0..n)
        .map(|i| member_pdc_w.iter().map(|p| p[i]).sum())
        .collect();
    let group_pac_w = pvwatts_ac(&pdc_sum, rating.pdc0_inv_w, rating.eta_inv_nom);

    let member_share: Vec<Vec<f64>> = member_pdc_w
        .iter()
        .map(|pdc| {
            pdc.iter()
                .zip(&pdc_sum)
                .map(|(p, total)| if *total > 0.0 { p / total } else { 0.0 })
                .collect()
        })
        .collect();
    let member_pac_w: Vec<Vec<f64>> = member_share
        .iter()
        .map(|share| share.iter().zip(&group_pac_w).map(|(s, pac)| s * pac).collect())
        .collect();

    let clipped = pdc_sum
        .iter()
        .zip(&group_pac_w)
        .filter(|(pdc, pac)| **pdc > 0.0 && **pac >= rating.eta_inv_nom * rating.pdc0_inv_w)
        .count();
    debug.emit(DebugEvent::new(
        "inverter.allocate",
        json!({
            "members": member_pdc_w.len(),
            "pdc0_inv_w": rating.pdc0_inv_w,
            "eta_inv_nom": rating.eta_inv_nom,
            "explicit_rating": rating.explicit,
            "pdc_sum_max_w": pdc_sum.iter().copied().fold(0.0, f64::max),
            "pac_max_w": group_pac_w.iter().copied().fold(0.0, f64::max),
            "clipped_samples": clipped,
        }),
    ));

    GroupAllocation {
        group_pac_w,
        member_pac_w,
        member_share,
    }
}
