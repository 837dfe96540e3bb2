//! Pure schema transformations for ADD COLUMN.
//!
//! A new column is spliced into the logical column order right away, but its
//! `offset` points past the existing columns until the backfill has run:
//! row codecs and indexes keep addressing the old layout while the column is
//! not public. `adjust_column_offsets` then folds every `temp_offset` into
//! `offset` in one step.

use std::collections::BTreeMap;

use falcon_common::datum::Datum;
use falcon_common::error::{DdlError, FalconResult};
use falcon_common::job::{AlterSpecification, ColumnPosition};
use falcon_common::schema::{ColumnInfo, SchemaState, TableInfo};
use falcon_common::types::ColumnId;

/// Old offset → new offset, as applied by [`adjust_column_offsets`].
pub type OffsetRemap = BTreeMap<usize, usize>;

fn resolve_position(info: &TableInfo, position: &ColumnPosition) -> FalconResult<usize> {
    let pos = match position {
        ColumnPosition::End => info.columns.len(),
        ColumnPosition::First => 0,
        ColumnPosition::After(name) => {
            let anchor = info
                .find_column(name)
                .ok_or_else(|| DdlError::NoSuchColumn(name.clone()))?;
            anchor.offset + 1
        }
    };
    Ok(pos.min(info.columns.len()))
}

/// Splice the column described by `spec` into a copy of `info`.
///
/// The returned table has the new column (state `None`) at its logical
/// position and every column's `temp_offset` set to its logical index. The
/// new column's `offset` is the old column count.
pub fn insert_column(
    info: &TableInfo,
    spec: &AlterSpecification,
) -> FalconResult<(TableInfo, ColumnInfo)> {
    let col_spec = &spec.column;
    if col_spec.name.is_empty() {
        return Err(DdlError::InvalidArgs("empty column name".into()).into());
    }
    let default_value = col_spec.default_value.clone().unwrap_or(Datum::Null);
    if !default_value.fits(&col_spec.data_type) {
        return Err(DdlError::InvalidArgs(format!(
            "default {} does not fit column {} of type {}",
            default_value, col_spec.name, col_spec.data_type
        ))
        .into());
    }

    let position = resolve_position(info, &spec.position)?;
    let column = ColumnInfo {
        id: ColumnId(info.max_column_id + 1),
        name: col_spec.name.clone(),
        offset: info.columns.len(),
        temp_offset: position,
        data_type: col_spec.data_type.clone(),
        default_value,
        state: SchemaState::None,
    };

    let mut out = info.clone();
    out.columns.insert(position, column.clone());
    for (i, col) in out.columns.iter_mut().enumerate() {
        col.temp_offset = i;
    }
    out.max_column_id = column.id.0;
    Ok((out, column))
}

/// Make every column's pending logical position its real offset and rewrite
/// index column references to match.
pub fn adjust_column_offsets(info: &TableInfo) -> (TableInfo, OffsetRemap) {
    let mut out = info.clone();
    let mut remap = OffsetRemap::new();
    for col in &mut out.columns {
        remap.insert(col.offset, col.temp_offset);
        col.offset = col.temp_offset;
    }
    for index in &mut out.indices {
        for ic in &mut index.columns {
            if let Some(&new) = remap.get(&ic.offset) {
                ic.offset = new;
            }
        }
    }
    (out, remap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_common::types::{DataType, IndexId, TableId};

    fn ab() -> TableInfo {
        TableInfo::new(
            TableId(1),
            "t",
            vec![("a", DataType::Int64), ("b", DataType::Text)],
        )
        .with_index(IndexId(1), "idx_b", &["b"])
        .unwrap()
    }

    fn names(info: &TableInfo) -> Vec<&str> {
        info.columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_insert_at_end_by_default() {
        let spec = AlterSpecification::add_column("c", DataType::Int32, None);
        let (out, col) = insert_column(&ab(), &spec).unwrap();
        assert_eq!(names(&out), vec!["a", "b", "c"]);
        assert_eq!(col.offset, 2);
        assert_eq!(col.temp_offset, 2);
        assert_eq!(col.id, ColumnId(3));
        assert_eq!(col.state, SchemaState::None);
        assert_eq!(col.default_value, Datum::Null);
        assert_eq!(out.max_column_id, 3);
    }

    #[test]
    fn test_insert_first() {
        let spec =
            AlterSpecification::add_column("c", DataType::Int32, None).at(ColumnPosition::First);
        let (out, col) = insert_column(&ab(), &spec).unwrap();
        assert_eq!(names(&out), vec!["c", "a", "b"]);
        assert_eq!(col.offset, 2);
        assert_eq!(col.temp_offset, 0);
        let temps: Vec<usize> = out.columns.iter().map(|c| c.temp_offset).collect();
        assert_eq!(temps, vec![0, 1, 2]);
        // existing offsets untouched until adjustment
        assert_eq!(out.find_column("b").unwrap().offset, 1);
    }

    #[test]
    fn test_insert_after_and_adjust_remaps_index() {
        let before = ab();
        let spec = AlterSpecification::add_column("c", DataType::Int64, Some(Datum::Int64(9)))
            .at(ColumnPosition::After("a".into()));
        let (inserted, col) = insert_column(&before, &spec).unwrap();
        assert_eq!(names(&inserted), vec!["a", "c", "b"]);
        assert_eq!(col.offset, 2);
        assert_eq!(col.temp_offset, 1);
        assert_eq!(col.default_value, Datum::Int64(9));
        // input unchanged
        assert_eq!(before.columns.len(), 2);

        let (adjusted, remap) = adjust_column_offsets(&inserted);
        let offsets: Vec<usize> = adjusted.columns.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(adjusted.find_column("c").unwrap().offset, 1);
        assert_eq!(adjusted.find_column("b").unwrap().offset, 2);
        assert_eq!(remap.get(&1), Some(&2));
        assert_eq!(remap.get(&2), Some(&1));
        assert_eq!(adjusted.indices[0].columns[0].offset, 2);
    }

    #[test]
    fn test_insert_after_missing_column() {
        let spec = AlterSpecification::add_column("c", DataType::Int64, None)
            .at(ColumnPosition::After("zzz".into()));
        let err = insert_column(&ab(), &spec).unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn test_default_must_fit_type() {
        let spec =
            AlterSpecification::add_column("c", DataType::Int64, Some(Datum::Text("x".into())));
        assert!(insert_column(&ab(), &spec).unwrap_err().is_user_error());
    }

    #[test]
    fn test_adjust_without_pending_column_is_identity() {
        let info = ab();
        let (out, remap) = adjust_column_offsets(&info);
        assert_eq!(out, info);
        assert!(remap.iter().all(|(old, new)| old == new));
    }
}
