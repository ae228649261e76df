//! Read planning: coalescing entity reads into minimal device transactions.
//!
//! The planner partitions entities by slave and address space, then
//! greedily merges adjacent or overlapping register spans into read
//! operations bounded by the device's maximum read size. The resulting
//! plan is deterministic for a given entity set, so it is only rebuilt
//! when the entity set or the maximum read size changes.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::entity::{ModbusDataType, SlaveEntity};

/// Contract violations detected while building a plan.
///
/// These are programming/configuration errors and surface to the caller
/// instead of being swallowed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("max_read_size must be at least 1")]
    ZeroMaxReadSize,

    #[error("Entity has an empty key")]
    EmptyKey,

    #[error("Duplicate entity key '{0}'")]
    DuplicateKey(String),

    #[error("Entity '{0}': register_count must be at least 1")]
    ZeroRegisterCount(String),

    #[error("Entity '{0}': register range exceeds the 16-bit address space")]
    AddressOverflow(String),
}

/// One device transaction: a contiguous read in a single address space.
///
/// The Modbus function code is implied by `data_type`. `count` never
/// exceeds the `max_read_size` the plan was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOperation {
    pub slave_id: u8,
    pub data_type: ModbusDataType,
    pub start: u16,
    pub count: u16,
}

/// Where one entity's data sits inside the plan: the operation index and
/// the word/bit window within that operation's payload.
///
/// An entity has more than one segment only when its own register span
/// had to be split across consecutive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySegment {
    pub operation: usize,
    pub offset: usize,
    pub len: usize,
}

/// Ordered read operations plus the entity-to-payload mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadPlan {
    pub operations: Vec<ReadOperation>,
    pub mapping: HashMap<String, Vec<EntitySegment>>,
}

impl ReadPlan {
    /// Whether the plan covers no entities at all.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of entities the plan covers.
    pub fn entity_count(&self) -> usize {
        self.mapping.len()
    }
}

/// An entity span being merged into the currently open range.
struct PendingSpan<'a> {
    key: &'a str,
    start: u32,
    end: u32,
}

/// An open address range and the entities it covers.
struct OpenRange<'a> {
    start: u32,
    end: u32,
    members: Vec<PendingSpan<'a>>,
}

/// Build the minimal set of read operations covering all entities.
///
/// Entities with identical `(slave_id, data_type, register_address)` are
/// aliases of the same physical register and resolve against a single
/// operation; the read is never duplicated.
pub fn build_plan(entities: &[SlaveEntity], max_read_size: u16) -> Result<ReadPlan, PlanError> {
    if max_read_size == 0 {
        return Err(PlanError::ZeroMaxReadSize);
    }

    let mut seen = HashSet::new();
    let mut groups: BTreeMap<(u8, ModbusDataType), Vec<PendingSpan<'_>>> = BTreeMap::new();

    for entity in entities {
        let desc = &entity.desc;
        if desc.key.is_empty() {
            return Err(PlanError::EmptyKey);
        }
        if !seen.insert(desc.key.as_str()) {
            return Err(PlanError::DuplicateKey(desc.key.clone()));
        }
        if desc.register_count == 0 {
            return Err(PlanError::ZeroRegisterCount(desc.key.clone()));
        }

        let start = u32::from(desc.register_address);
        let end = start + u32::from(desc.register_count);
        if end > 0x10000 {
            return Err(PlanError::AddressOverflow(desc.key.clone()));
        }

        groups
            .entry((entity.slave_id, desc.data_type))
            .or_default()
            .push(PendingSpan {
                key: &desc.key,
                start,
                end,
            });
    }

    let mut plan = ReadPlan::default();
    let max = u32::from(max_read_size);

    for ((slave_id, data_type), mut spans) in groups {
        spans.sort_by_key(|span| span.start);

        let mut open: Option<OpenRange<'_>> = None;
        for span in spans {
            match open.take() {
                Some(mut range)
                    if span.start <= range.end && range.end.max(span.end) - range.start <= max =>
                {
                    range.end = range.end.max(span.end);
                    range.members.push(span);
                    open = Some(range);
                }
                Some(range) => {
                    close_range(range, slave_id, data_type, max, &mut plan);
                    open = Some(OpenRange {
                        start: span.start,
                        end: span.end,
                        members: vec![span],
                    });
                }
                None => {
                    open = Some(OpenRange {
                        start: span.start,
                        end: span.end,
                        members: vec![span],
                    });
                }
            }
        }
        if let Some(range) = open.take() {
            close_range(range, slave_id, data_type, max, &mut plan);
        }
    }

    Ok(plan)
}

/// Emit the operations for a closed range and record every member
/// entity's payload window. A range longer than `max` (a single oversized
/// entity) is split into consecutive operations.
fn close_range(
    range: OpenRange<'_>,
    slave_id: u8,
    data_type: ModbusDataType,
    max: u32,
    plan: &mut ReadPlan,
) {
    let first_op = plan.operations.len();

    let mut chunk_start = range.start;
    while chunk_start < range.end {
        let count = (range.end - chunk_start).min(max);
        plan.operations.push(ReadOperation {
            slave_id,
            data_type,
            start: chunk_start as u16,
            count: count as u16,
        });
        chunk_start += count;
    }

    for member in &range.members {
        let mut segments = Vec::new();
        for (index, op) in plan.operations[first_op..].iter().enumerate() {
            let op_start = u32::from(op.start);
            let op_end = op_start + u32::from(op.count);
            let overlap_start = member.start.max(op_start);
            let overlap_end = member.end.min(op_end);
            if overlap_start < overlap_end {
                segments.push(EntitySegment {
                    operation: first_op + index,
                    offset: (overlap_start - op_start) as usize,
                    len: (overlap_end - overlap_start) as usize,
                });
            }
        }
        plan.mapping.insert(member.key.to_string(), segments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ControlKind, Conversion, EntityDescriptor};

    fn entity(key: &str, data_type: ModbusDataType, address: u16, count: u16) -> SlaveEntity {
        SlaveEntity::new(
            1,
            EntityDescriptor {
                key: key.to_string(),
                name: key.to_string(),
                register_address: address,
                register_count: count,
                data_type,
                conversion: Conversion::default(),
                control: ControlKind::Sensor,
            },
        )
    }

    fn holding(key: &str, address: u16, count: u16) -> SlaveEntity {
        entity(key, ModbusDataType::HoldingRegister, address, count)
    }

    #[test]
    fn test_empty_entity_list() {
        let plan = build_plan(&[], 8).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.entity_count(), 0);
    }

    #[test]
    fn test_adjacent_spans_coalesce() {
        let entities = [holding("a", 0, 2), holding("b", 2, 2), holding("c", 4, 1)];
        let plan = build_plan(&entities, 10).unwrap();

        assert_eq!(
            plan.operations,
            vec![ReadOperation {
                slave_id: 1,
                data_type: ModbusDataType::HoldingRegister,
                start: 0,
                count: 5,
            }]
        );
        assert_eq!(
            plan.mapping["b"],
            vec![EntitySegment {
                operation: 0,
                offset: 2,
                len: 2,
            }]
        );
    }

    #[test]
    fn test_gap_closes_range() {
        let entities = [holding("a", 0, 1), holding("b", 10, 1)];
        let plan = build_plan(&entities, 8).unwrap();

        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.operations[0].start, 0);
        assert_eq!(plan.operations[1].start, 10);
    }

    #[test]
    fn test_merge_respects_max_read_size() {
        let entities = [holding("a", 0, 3), holding("b", 3, 3), holding("c", 6, 3)];
        let plan = build_plan(&entities, 6).unwrap();

        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.operations[0].count, 6);
        assert_eq!(plan.operations[1].start, 6);
        assert_eq!(plan.operations[1].count, 3);
        assert!(plan.operations.iter().all(|op| op.count <= 6));
    }

    #[test]
    fn test_data_types_never_mix() {
        let entities = [
            entity("reg", ModbusDataType::HoldingRegister, 0, 1),
            entity("inp", ModbusDataType::InputRegister, 0, 1),
            entity("coil", ModbusDataType::Coil, 0, 1),
        ];
        let plan = build_plan(&entities, 8).unwrap();

        assert_eq!(plan.operations.len(), 3);
        let types: HashSet<_> = plan.operations.iter().map(|op| op.data_type).collect();
        assert_eq!(types.len(), 3);
    }

    #[test]
    fn test_slaves_never_mix() {
        let mut second = holding("b", 0, 1);
        second.slave_id = 2;
        let entities = [holding("a", 0, 1), second];

        let plan = build_plan(&entities, 8).unwrap();
        assert_eq!(plan.operations.len(), 2);
    }

    #[test]
    fn test_aliased_entities_share_one_operation() {
        let entities = [holding("key1", 1, 1), holding("key2", 1, 1), holding("key3", 1, 1)];
        let plan = build_plan(&entities, 3).unwrap();

        assert_eq!(plan.operations.len(), 1);
        for key in ["key1", "key2", "key3"] {
            assert_eq!(
                plan.mapping[key],
                vec![EntitySegment {
                    operation: 0,
                    offset: 0,
                    len: 1,
                }]
            );
        }
    }

    #[test]
    fn test_oversized_entity_splits_across_operations() {
        let entities = [holding("big", 100, 9)];
        let plan = build_plan(&entities, 3).unwrap();

        assert_eq!(plan.operations.len(), 3);
        assert_eq!(
            plan.operations
                .iter()
                .map(|op| (op.start, op.count))
                .collect::<Vec<_>>(),
            vec![(100, 3), (103, 3), (106, 3)]
        );
        assert_eq!(
            plan.mapping["big"],
            vec![
                EntitySegment { operation: 0, offset: 0, len: 3 },
                EntitySegment { operation: 1, offset: 0, len: 3 },
                EntitySegment { operation: 2, offset: 0, len: 3 },
            ]
        );
    }

    #[test]
    fn test_bit_addresses_merge_like_words() {
        let entities = [
            entity("c1", ModbusDataType::Coil, 0, 1),
            entity("c2", ModbusDataType::Coil, 1, 1),
            entity("c3", ModbusDataType::Coil, 2, 1),
        ];
        let plan = build_plan(&entities, 16).unwrap();

        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].count, 3);
        assert_eq!(
            plan.mapping["c3"],
            vec![EntitySegment {
                operation: 0,
                offset: 2,
                len: 1,
            }]
        );
    }

    #[test]
    fn test_overlapping_spans_merge() {
        let entities = [holding("wide", 0, 4), holding("inner", 1, 2)];
        let plan = build_plan(&entities, 8).unwrap();

        assert_eq!(plan.operations.len(), 1);
        assert_eq!(
            plan.mapping["inner"],
            vec![EntitySegment {
                operation: 0,
                offset: 1,
                len: 2,
            }]
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let entities = [holding("dup", 0, 1), holding("dup", 5, 1)];
        assert_eq!(
            build_plan(&entities, 8),
            Err(PlanError::DuplicateKey("dup".to_string()))
        );
    }

    #[test]
    fn test_zero_register_count_rejected() {
        let entities = [holding("bad", 0, 0)];
        assert_eq!(
            build_plan(&entities, 8),
            Err(PlanError::ZeroRegisterCount("bad".to_string()))
        );
    }

    #[test]
    fn test_zero_max_read_size_rejected() {
        assert_eq!(build_plan(&[], 0), Err(PlanError::ZeroMaxReadSize));
    }

    #[test]
    fn test_address_overflow_rejected() {
        let entities = [holding("edge", 0xFFFF, 2)];
        assert_eq!(
            build_plan(&entities, 8),
            Err(PlanError::AddressOverflow("edge".to_string()))
        );
    }
}
