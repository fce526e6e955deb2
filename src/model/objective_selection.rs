use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{business_if, MdrResult};
use crate::model::{normalize_string, Grouping, Id, ReferenceKind, Selection, SelectionChecks};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSelectionInput {
    #[serde(default)]
    pub objective_uid: Option<String>,
    #[serde(default)]
    pub objective_version: Option<String>,
    #[serde(default)]
    pub objective_level_uid: Option<String>,
}

impl ObjectiveSelectionInput {
    /// Patch semantics: absent fields keep the current selection's values.
    pub fn merged_over(self, current: &StudySelectionObjectiveVO) -> Self {
        Self {
            objective_uid: self.objective_uid.or_else(|| current.objective_uid.clone()),
            objective_version: self.objective_version.or_else(|| current.objective_version.clone()),
            objective_level_uid: self
                .objective_level_uid
                .or_else(|| current.objective_level_uid.clone()),
        }
    }
}

/// One selection between a study and an objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySelectionObjectiveVO {
    pub study_selection_uid: Id,
    pub study_uid: Option<Id>,
    pub objective_uid: Option<String>,
    pub objective_version: Option<String>,
    pub objective_level_uid: Option<String>,
    pub objective_level_order: Option<u32>,
    pub start_date: DateTime<Utc>,
    pub author_id: String,
    #[serde(default)]
    pub accepted_version: bool,
}

impl StudySelectionObjectiveVO {
    pub fn from_input_values(
        input: ObjectiveSelectionInput,
        objective_level_order: Option<u32>,
        author_id: &str,
        study_uid: Option<Id>,
        study_selection_uid: Option<Id>,
        start_date: Option<DateTime<Utc>>,
        generate_uid: impl FnOnce() -> Id,
    ) -> Self {
        let study_selection_uid = study_selection_uid.unwrap_or_else(generate_uid);
        Self {
            study_selection_uid: study_selection_uid.trim().to_string(),
            study_uid,
            objective_uid: normalize_string(input.objective_uid.as_deref()),
            objective_version: normalize_string(input.objective_version.as_deref()),
            objective_level_uid: normalize_string(input.objective_level_uid.as_deref()),
            objective_level_order,
            start_date: start_date.unwrap_or_else(Utc::now),
            author_id: author_id.to_string(),
            accepted_version: false,
        }
    }

    pub fn update_objective_version(&self, objective_version: &str) -> Self {
        Self {
            objective_version: Some(objective_version.to_string()),
            ..self.clone()
        }
    }

    pub fn accept_versions(&self) -> Self {
        Self {
            accepted_version: true,
            ..self.clone()
        }
    }
}

impl Selection for StudySelectionObjectiveVO {
    const KIND: &'static str = "StudyObjective";
    const DISPLAY_NAME: &'static str = "Study Objective";

    type UniqueKey = Option<String>;

    fn study_selection_uid(&self) -> &str {
        &self.study_selection_uid
    }

    fn author_id(&self) -> &str {
        &self.author_id
    }

    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn grouping(&self) -> Grouping {
        Grouping::new(self.objective_level_order.map(u64::from), None)
    }

    fn unique_key(&self) -> Option<String> {
        self.objective_uid.clone()
    }

    fn duplicate_message(&self) -> String {
        format!(
            "There is already a study objective selected for the objective '{}'",
            self.objective_uid.as_deref().unwrap_or_default()
        )
    }

    fn references(&self) -> Vec<(ReferenceKind, String)> {
        let mut refs = Vec::new();
        if let Some(uid) = &self.objective_uid {
            refs.push((ReferenceKind::Objective, uid.clone()));
        }
        if let Some(uid) = &self.objective_level_uid {
            refs.push((ReferenceKind::CtTerm, uid.clone()));
        }
        refs
    }

    fn validate(&self, checks: &dyn SelectionChecks) -> MdrResult<()> {
        if let Some(uid) = &self.objective_uid {
            business_if(!checks.objective_exists(uid), || {
                format!("There is no approved Objective with UID '{}'.", uid)
            })?;
        }
        if let Some(uid) = &self.objective_level_uid {
            business_if(!checks.ct_term_exists(uid), || {
                format!("There is no approved Objective Level with UID '{}'.", uid)
            })?;
        }
        Ok(())
    }
}
