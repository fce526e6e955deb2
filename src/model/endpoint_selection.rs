use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{business_if, validation_if, MdrResult};
use crate::model::{
    normalize_string, uid_ordinal, Grouping, Id, ReferenceKind, Selection, SelectionChecks,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointUnit {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Caller input for creating or patching a study endpoint selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSelectionInput {
    #[serde(default)]
    pub endpoint_uid: Option<String>,
    #[serde(default)]
    pub endpoint_version: Option<String>,
    #[serde(default)]
    pub endpoint_level_uid: Option<String>,
    #[serde(default)]
    pub endpoint_sublevel_uid: Option<String>,
    #[serde(default)]
    pub study_objective_uid: Option<String>,
    #[serde(default)]
    pub timeframe_uid: Option<String>,
    #[serde(default)]
    pub timeframe_version: Option<String>,
    #[serde(default)]
    pub endpoint_units: Vec<EndpointUnit>,
    #[serde(default)]
    pub unit_separator: Option<String>,
}

impl EndpointSelectionInput {
    /// Patch semantics: absent fields keep the current selection's values.
    /// New units without a separator drop the current separator.
    pub fn merged_over(self, current: &StudySelectionEndpointVO) -> Self {
        let units_given = !self.endpoint_units.is_empty();
        let unit_separator = match (self.unit_separator, units_given) {
            (Some(separator), _) => Some(separator),
            (None, true) => None,
            (None, false) => current.unit_separator.clone(),
        };
        Self {
            endpoint_uid: self.endpoint_uid.or_else(|| current.endpoint_uid.clone()),
            endpoint_version: self.endpoint_version.or_else(|| current.endpoint_version.clone()),
            endpoint_level_uid: self.endpoint_level_uid.or_else(|| current.endpoint_level_uid.clone()),
            endpoint_sublevel_uid: self
                .endpoint_sublevel_uid
                .or_else(|| current.endpoint_sublevel_uid.clone()),
            study_objective_uid: self
                .study_objective_uid
                .or_else(|| current.study_objective_uid.clone()),
            timeframe_uid: self.timeframe_uid.or_else(|| current.timeframe_uid.clone()),
            timeframe_version: self.timeframe_version.or_else(|| current.timeframe_version.clone()),
            endpoint_units: if units_given {
                self.endpoint_units
            } else {
                current.endpoint_units.clone()
            },
            unit_separator,
        }
    }
}

/// One selection between a study and an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySelectionEndpointVO {
    pub study_selection_uid: Id,
    pub study_uid: Option<Id>,
    pub endpoint_uid: Option<String>,
    pub endpoint_version: Option<String>,
    pub endpoint_level_uid: Option<String>,
    pub endpoint_sublevel_uid: Option<String>,
    pub study_objective_uid: Option<String>,
    pub timeframe_uid: Option<String>,
    pub timeframe_version: Option<String>,
    pub endpoint_units: Vec<EndpointUnit>,
    pub unit_separator: Option<String>,
    pub endpoint_level_order: Option<u32>,
    pub start_date: DateTime<Utc>,
    pub author_id: String,
    #[serde(default)]
    pub accepted_version: bool,
}

impl StudySelectionEndpointVO {
    /// Builds a normalised value object. A uid is only generated when none is given.
    pub fn from_input_values(
        input: EndpointSelectionInput,
        endpoint_level_order: Option<u32>,
        author_id: &str,
        study_uid: Option<Id>,
        study_selection_uid: Option<Id>,
        start_date: Option<DateTime<Utc>>,
        generate_uid: impl FnOnce() -> Id,
    ) -> Self {
        let study_selection_uid = study_selection_uid.unwrap_or_else(generate_uid);

        // first occurrence of each unit uid wins, units without uid are dropped
        let mut endpoint_units: Vec<EndpointUnit> = Vec::new();
        for unit in input.endpoint_units {
            let Some(uid) = normalize_string(Some(&unit.uid)) else {
                continue;
            };
            if endpoint_units.iter().any(|u| u.uid == uid) {
                continue;
            }
            endpoint_units.push(EndpointUnit {
                uid,
                name: normalize_string(unit.name.as_deref()),
            });
        }

        Self {
            study_selection_uid: study_selection_uid.trim().to_string(),
            study_uid,
            endpoint_uid: normalize_string(input.endpoint_uid.as_deref()),
            endpoint_version: normalize_string(input.endpoint_version.as_deref()),
            endpoint_level_uid: normalize_string(input.endpoint_level_uid.as_deref()),
            endpoint_sublevel_uid: normalize_string(input.endpoint_sublevel_uid.as_deref()),
            study_objective_uid: normalize_string(input.study_objective_uid.as_deref()),
            timeframe_uid: normalize_string(input.timeframe_uid.as_deref()),
            timeframe_version: normalize_string(input.timeframe_version.as_deref()),
            endpoint_units,
            unit_separator: normalize_string(input.unit_separator.as_deref()),
            endpoint_level_order,
            start_date: start_date.unwrap_or_else(Utc::now),
            author_id: author_id.to_string(),
            accepted_version: false,
        }
    }

    pub fn update_endpoint_version(&self, endpoint_version: &str) -> Self {
        Self {
            endpoint_version: Some(endpoint_version.to_string()),
            ..self.clone()
        }
    }

    pub fn update_timeframe_version(&self, timeframe_version: &str) -> Self {
        Self {
            timeframe_version: Some(timeframe_version.to_string()),
            ..self.clone()
        }
    }

    pub fn accept_versions(&self) -> Self {
        Self {
            accepted_version: true,
            ..self.clone()
        }
    }

    /// Same selection detached from its study objective.
    pub fn without_study_objective(&self) -> Self {
        Self {
            study_objective_uid: None,
            ..self.clone()
        }
    }
}

/// Uniqueness tuple: objective, endpoint, timeframe and units.
pub type EndpointUniqueKey = (
    Option<String>,
    Option<String>,
    Option<String>,
    Vec<EndpointUnit>,
);

impl Selection for StudySelectionEndpointVO {
    const KIND: &'static str = "StudyEndpoint";
    const DISPLAY_NAME: &'static str = "Study Endpoint";

    type UniqueKey = EndpointUniqueKey;

    fn study_selection_uid(&self) -> &str {
        &self.study_selection_uid
    }

    fn author_id(&self) -> &str {
        &self.author_id
    }

    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Grouped by the selected study objective, then by endpoint level.
    fn grouping(&self) -> Grouping {
        Grouping::new(
            self.study_objective_uid.as_deref().and_then(uid_ordinal),
            self.endpoint_level_order.map(u64::from),
        )
    }

    fn unique_key(&self) -> EndpointUniqueKey {
        (
            self.study_objective_uid.clone(),
            self.endpoint_uid.clone(),
            self.timeframe_uid.clone(),
            self.endpoint_units.clone(),
        )
    }

    fn duplicate_message(&self) -> String {
        "There is already a study endpoint created for the selected endpoint, timeframe and unit combination".to_string()
    }

    fn references(&self) -> Vec<(ReferenceKind, String)> {
        let mut refs = Vec::new();
        if let Some(uid) = &self.endpoint_uid {
            refs.push((ReferenceKind::Endpoint, uid.clone()));
        }
        if let Some(uid) = &self.timeframe_uid {
            refs.push((ReferenceKind::Timeframe, uid.clone()));
        }
        if let Some(uid) = &self.study_objective_uid {
            refs.push((ReferenceKind::StudyObjective, uid.clone()));
        }
        if let Some(uid) = &self.endpoint_level_uid {
            refs.push((ReferenceKind::CtTerm, uid.clone()));
        }
        if let Some(uid) = &self.endpoint_sublevel_uid {
            refs.push((ReferenceKind::CtTerm, uid.clone()));
        }
        for unit in &self.endpoint_units {
            refs.push((ReferenceKind::UnitDefinition, unit.uid.clone()));
        }
        refs
    }

    fn validate(&self, checks: &dyn SelectionChecks) -> MdrResult<()> {
        if let Some(uid) = &self.endpoint_uid {
            business_if(!checks.endpoint_exists(uid), || {
                format!("There is no approved Endpoint with UID '{}'.", uid)
            })?;
        }
        if let Some(uid) = &self.timeframe_uid {
            business_if(!checks.timeframe_exists(uid), || {
                format!("There is no approved Timeframe with UID '{}'.", uid)
            })?;
        }
        if let Some(uid) = &self.study_objective_uid {
            business_if(!checks.study_objective_exists(uid), || {
                format!("There is no selected Study Objective with UID '{}'.", uid)
            })?;
        }
        validation_if(
            self.endpoint_units.len() > 1 && self.unit_separator.is_none(),
            || "In case of more than one endpoint units, a unit separator is required.".to_string(),
        )?;
        validation_if(
            self.unit_separator.is_some() && self.endpoint_units.len() < 2,
            || {
                format!(
                    "Separator should only be set if more than 1 units are selected, got {}.",
                    self.endpoint_units.len()
                )
            },
        )?;
        if let Some(uid) = &self.endpoint_level_uid {
            business_if(!checks.ct_term_exists(uid), || {
                format!("There is no approved Endpoint Level with UID '{}'.", uid)
            })?;
        }
        if let Some(uid) = &self.endpoint_sublevel_uid {
            business_if(!checks.ct_term_exists(uid), || {
                format!("There is no approved Endpoint Sub Level with UID '{}'.", uid)
            })?;
        }
        for unit in &self.endpoint_units {
            validation_if(unit.uid.trim().is_empty(), || {
                format!("There is no uid for unit definition '{:?}'.", unit.name)
            })?;
            validation_if(!checks.unit_definition_exists(&unit.uid), || {
                format!("There is no approved Unit Definition with UID '{}'.", unit.uid)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MdrError;
    use crate::model::AcceptAll;

    fn unit(uid: &str) -> EndpointUnit {
        EndpointUnit {
            uid: uid.to_string(),
            name: None,
        }
    }

    fn vo(units: Vec<EndpointUnit>, separator: Option<&str>) -> StudySelectionEndpointVO {
        StudySelectionEndpointVO::from_input_values(
            EndpointSelectionInput {
                endpoint_uid: Some("Endpoint_000001".to_string()),
                endpoint_units: units,
                unit_separator: separator.map(|s| s.to_string()),
                ..Default::default()
            },
            Some(1),
            "author",
            Some("Study_000001".to_string()),
            None,
            None,
            || "StudyEndpoint_000001".to_string(),
        )
    }

    struct KnownUids(Vec<&'static str>);

    impl SelectionChecks for KnownUids {
        fn objective_exists(&self, uid: &str) -> bool {
            self.0.contains(&uid)
        }
        fn endpoint_exists(&self, uid: &str) -> bool {
            self.0.contains(&uid)
        }
        fn timeframe_exists(&self, uid: &str) -> bool {
            self.0.contains(&uid)
        }
        fn study_objective_exists(&self, uid: &str) -> bool {
            self.0.contains(&uid)
        }
        fn ct_term_exists(&self, uid: &str) -> bool {
            self.0.contains(&uid)
        }
        fn unit_definition_exists(&self, uid: &str) -> bool {
            self.0.contains(&uid)
        }
    }

    #[test]
    fn test_factory_normalizes_and_dedups_units() {
        let vo = StudySelectionEndpointVO::from_input_values(
            EndpointSelectionInput {
                endpoint_uid: Some("  Endpoint_000001 ".to_string()),
                endpoint_level_uid: Some("".to_string()),
                endpoint_units: vec![unit("u1"), unit(" u1 "), unit(""), unit("u2")],
                unit_separator: Some("and".to_string()),
                ..Default::default()
            },
            None,
            "author",
            None,
            None,
            None,
            || "StudyEndpoint_000007".to_string(),
        );
        assert_eq!(vo.study_selection_uid, "StudyEndpoint_000007");
        assert_eq!(vo.endpoint_uid.as_deref(), Some("Endpoint_000001"));
        assert_eq!(vo.endpoint_level_uid, None);
        assert_eq!(vo.endpoint_units, vec![unit("u1"), unit("u2")]);
        assert!(!vo.accepted_version);
    }

    #[test]
    fn test_two_units_without_separator_is_rejected() {
        let err = vo(vec![unit("u1"), unit("u2")], None)
            .validate(&AcceptAll)
            .unwrap_err();
        assert!(matches!(err, MdrError::Validation(_)));
        assert!(err.to_string().to_lowercase().contains("separator"));
    }

    #[test]
    fn test_single_unit_with_separator_is_rejected() {
        let err = vo(vec![unit("u1")], Some("and")).validate(&AcceptAll).unwrap_err();
        assert!(matches!(err, MdrError::Validation(_)));
        assert!(err.to_string().to_lowercase().contains("separator"));
    }

    #[test]
    fn test_valid_unit_separator_states() {
        assert!(vo(vec![], None).validate(&AcceptAll).is_ok());
        assert!(vo(vec![unit("u1")], None).validate(&AcceptAll).is_ok());
        assert!(vo(vec![unit("u1"), unit("u2")], Some("or")).validate(&AcceptAll).is_ok());
    }

    #[test]
    fn test_unknown_references_are_rejected() {
        let checks = KnownUids(vec!["Endpoint_000001"]);
        assert!(vo(vec![], None).validate(&checks).is_ok());

        let err = vo(vec![unit("u9")], None).validate(&checks).unwrap_err();
        assert!(matches!(err, MdrError::Validation(_)));
        assert!(err.to_string().contains("u9"));

        let missing_endpoint = KnownUids(vec![]);
        let err = vo(vec![], None).validate(&missing_endpoint).unwrap_err();
        assert!(matches!(err, MdrError::BusinessLogic(_)));
    }

    #[test]
    fn test_functional_updates_keep_identity() {
        let original = vo(vec![], None);
        let updated = original.update_endpoint_version("2.0").accept_versions();
        assert_eq!(updated.study_selection_uid, original.study_selection_uid);
        assert_eq!(updated.endpoint_version.as_deref(), Some("2.0"));
        assert!(updated.accepted_version);
        assert!(!original.accepted_version);
        assert_ne!(updated, original);
    }

    #[test]
    fn test_grouping_uses_objective_ordinal_then_level() {
        let mut vo = vo(vec![], None);
        vo.study_objective_uid = Some("StudyObjective_000004".to_string());
        assert_eq!(vo.grouping(), Grouping::new(Some(4), Some(1)));
        assert_eq!(vo.without_study_objective().grouping(), Grouping::new(None, Some(1)));
    }
}
