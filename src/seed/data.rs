use anyhow::Result;
use log::info;

use crate::logic::library_ops::LibraryItemOperations;
use crate::model::{ConceptValue, LibraryVO, ParentState, ReferenceKind, UserContext};
use crate::store::traits::{LibraryItemStore, Store};

pub const SEED_STUDY_UID: &str = "Study_000001";

/// Objective and endpoint levels with their codelist order.
const LEVEL_TERMS: &[(&str, u32)] = &[
    ("CTTerm_Primary", 1),
    ("CTTerm_Secondary", 2),
    ("CTTerm_Exploratory", 3),
];

const OBJECTIVES: &[&str] = &["Objective_000001", "Objective_000002", "Objective_000003"];
const ENDPOINTS: &[&str] = &["Endpoint_000001", "Endpoint_000002", "Endpoint_000003"];
const TIMEFRAMES: &[&str] = &["Timeframe_000001", "Timeframe_000002"];
const UNIT_DEFINITIONS: &[&str] = &["UnitDefinition_mg", "UnitDefinition_kg", "UnitDefinition_week"];

/// Registers the reference catalog the selection validation looks up.
pub async fn seed_reference_catalog<S: Store>(store: &S) -> Result<()> {
    for (uid, order) in LEVEL_TERMS {
        store.register_reference(ReferenceKind::CtTerm, uid, Some(*order)).await?;
    }
    for uid in OBJECTIVES {
        store.register_reference(ReferenceKind::Objective, uid, None).await?;
    }
    for uid in ENDPOINTS {
        store.register_reference(ReferenceKind::Endpoint, uid, None).await?;
    }
    for uid in TIMEFRAMES {
        store.register_reference(ReferenceKind::Timeframe, uid, None).await?;
    }
    for uid in UNIT_DEFINITIONS {
        store.register_reference(ReferenceKind::UnitDefinition, uid, None).await?;
    }
    Ok(())
}

/// Loads libraries, the reference catalog, a draft study and a couple of
/// library concepts. Safe to run against a store that was seeded before.
pub async fn load_seed_data<S: Store>(store: &S) -> Result<()> {
    info!("Seeding libraries and reference catalog");
    store.upsert_library(LibraryVO::new("Sponsor", true)).await?;
    store.upsert_library(LibraryVO::new("CDISC", false)).await?;
    seed_reference_catalog(store).await?;

    if store.parent_state(SEED_STUDY_UID).await?.is_none() {
        store.upsert_parent(SEED_STUDY_UID, ParentState::Draft).await?;
    }

    let existing = LibraryItemStore::<ConceptValue>::list_items(store, Some("Sponsor"), Default::default()).await?;
    if existing.is_empty() {
        let author = UserContext::system();
        let milligram = LibraryItemOperations::create_item(
            store,
            "Sponsor",
            ConceptValue {
                name: "milligram".to_string(),
                definition: Some("One thousandth of a gram".to_string()),
                abbreviation: Some("mg".to_string()),
            },
            author.author_id(),
        )
        .await?;
        LibraryItemOperations::approve::<S, ConceptValue>(store, &milligram.uid, author.author_id()).await?;

        LibraryItemOperations::create_item(
            store,
            "Sponsor",
            ConceptValue::named("week"),
            author.author_id(),
        )
        .await?;
    }

    info!("Seed data loaded for study {}", SEED_STUDY_UID);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::selection_ops::StudySelectionOperations;
    use crate::model::{ObjectiveSelectionInput, Page, StudySelectionObjectiveVO};
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let store = MemoryStore::new();
        load_seed_data(&store).await.unwrap();
        load_seed_data(&store).await.unwrap();

        let items = LibraryItemOperations::list_items::<_, ConceptValue>(&store, Some("Sponsor"), Page::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].version, "1.0");
        assert_eq!(items[1].version, "0.1");
    }

    #[tokio::test]
    async fn test_seeded_study_accepts_selections() {
        let store = MemoryStore::new();
        load_seed_data(&store).await.unwrap();

        let added = StudySelectionOperations::add_objective_selection(
            &store,
            SEED_STUDY_UID,
            ObjectiveSelectionInput {
                objective_uid: Some("Objective_000001".to_string()),
                objective_version: None,
                objective_level_uid: Some("CTTerm_Secondary".to_string()),
            },
            "author",
        )
        .await
        .unwrap();
        assert_eq!(added.order, 1);
        assert_eq!(added.selection.objective_level_order, Some(2));

        let listed = StudySelectionOperations::list_selections::<_, StudySelectionObjectiveVO>(&store, SEED_STUDY_UID)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
