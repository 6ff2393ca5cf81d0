use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use uuid::Uuid;

fn rank(key: &str) -> Rank {
    Rank::parse(key).expect("valid rank")
}

fn model_with(n: usize) -> (OrderModel, Vec<ObjectId>) {
    let mut model = OrderModel::new();
    let ids: Vec<ObjectId> = (0..n).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        model.assign(*id, "text").expect("assign");
    }
    (model, ids)
}

fn assert_strictly_ordered(model: &OrderModel) {
    let ranks: Vec<&Rank> = model
        .ordered_ids()
        .iter()
        .map(|id| model.rank(*id).expect("ranked"))
        .collect();
    assert!(ranks.windows(2).all(|w| w[0] < w[1]), "ranks not strictly ordered: {ranks:?}");
}

// =============================================================================
// assign
// =============================================================================

#[test]
fn assign_appends_on_top() {
    let (model, ids) = model_with(3);
    assert_eq!(model.ordered_ids(), ids.as_slice());
    assert_eq!(model.draw_index(ids[2]), Some(2));
    assert_eq!(model.nth(0), Some(ids[0]));
    assert_strictly_ordered(&model);
}

#[test]
fn assign_is_idempotent() {
    let (mut model, ids) = model_with(2);
    let before = model.rank(ids[0]).cloned();
    assert_eq!(model.assign(ids[0], "text").expect("assign"), 0);
    assert_eq!(model.rank(ids[0]).cloned(), before);
    assert_eq!(model.len(), 2);
}

#[test]
fn first_rank_is_initial_key() {
    let (model, ids) = model_with(1);
    assert_eq!(model.rank(ids[0]), Some(&Rank::initial()));
}

#[test]
fn assign_with_rank_keeps_free_rank() {
    let mut model = OrderModel::new();
    let id = Uuid::new_v4();
    let (index, repair) = model.assign_with_rank(id, rank("a5"), "image").expect("assign");
    assert_eq!(index, 0);
    assert!(repair.is_none());
    assert_eq!(model.rank(id), Some(&rank("a5")));
    assert_eq!(model.kind(id), Some("image"));
}

#[test]
fn duplicate_persisted_rank_is_repaired_on_load() {
    let mut model = OrderModel::new();
    let low = Uuid::new_v4();
    let high = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    model.assign_with_rank(low, rank("Zz"), "text").expect("load");
    model.assign_with_rank(high, rank("a1"), "text").expect("load");

    model.assign_with_rank(first, rank("a0"), "text").expect("load");
    let (_, repair) = model.assign_with_rank(second, rank("a0"), "text").expect("load");

    let repair = repair.expect("collision should be repaired");
    assert_eq!(repair.id, second);
    assert_eq!(repair.from, rank("a0"));
    assert_ne!(model.rank(first), model.rank(second));
    assert_eq!(model.ordered_ids(), &[low, first, second, high]);
    assert_strictly_ordered(&model);
}

#[test]
fn repair_sweep_moves_higher_id() {
    let mut model = OrderModel::new();
    let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
    ids.sort();
    model.write(ids[0], rank("a0"), Some("text"));
    model.write(ids[1], rank("a0"), Some("text"));
    assert_eq!(model.collisions(), vec![(ids[0], ids[1])]);

    let repairs = model.repair_collisions().expect("repair");
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].id, ids[1]);
    assert!(model.collisions().is_empty());
    assert_eq!(model.ordered_ids(), &ids);
}

#[test]
fn repair_sweep_handles_triples() {
    let mut model = OrderModel::new();
    for _ in 0..3 {
        model.write(Uuid::new_v4(), rank("a3"), Some("text"));
    }
    let top = Uuid::new_v4();
    model.write(top, rank("a4"), Some("text"));

    let repairs = model.repair_collisions().expect("repair");
    assert_eq!(repairs.len(), 2);
    assert_strictly_ordered(&model);
    assert_eq!(model.nth(3), Some(top));
}

#[test]
fn apply_rank_reports_clash_and_keeps_total_order() {
    let (mut model, ids) = model_with(2);
    let taken = model.rank(ids[0]).cloned().expect("ranked");
    let clash = model.apply_rank(ids[1], taken).expect("apply");
    assert_eq!(clash, Some(ids[0]));
    assert_eq!(model.ordered_ids().len(), 2);
}

#[test]
fn place_keeps_shared_rank_verbatim() {
    let (mut model, ids) = model_with(1);
    let taken = model.rank(ids[0]).cloned().expect("ranked");
    let newcomer = Uuid::new_v4();
    model.place(newcomer, taken.clone(), "text").expect("place");
    assert_eq!(model.rank(newcomer), Some(&taken));
    assert_eq!(model.ordered_ids().len(), 2);
    assert_eq!(model.collisions().len(), 1);
}

#[test]
fn apply_rank_rejects_unknown_id() {
    let mut model = OrderModel::new();
    assert!(matches!(model.apply_rank(Uuid::new_v4(), rank("a0")), Err(OrderError::NotFound(_))));
}

#[test]
fn remove_drops_rank_and_reindexes() {
    let (mut model, ids) = model_with(3);
    assert!(model.remove(ids[0]).is_some());
    assert!(model.remove(ids[0]).is_none());
    assert_eq!(model.draw_index(ids[1]), Some(0));
    assert_eq!(model.draw_index(ids[0]), None);
}

// =============================================================================
// moves
// =============================================================================

#[test]
fn move_up_swaps_two_objects() {
    let (mut model, ids) = model_with(2);
    let (x, y) = (ids[0], ids[1]);
    assert_eq!(model.ordered_ids(), &[x, y]);

    let outcome = model.move_by(x, 1).expect("move");
    assert!(matches!(outcome, MoveOutcome::Moved(_)));
    assert_eq!(model.ordered_ids(), &[y, x]);
    assert!(model.draw_index(y) < model.draw_index(x));
}

#[test]
fn move_at_extremes_signals_boundary() {
    let (mut model, ids) = model_with(3);
    let before: Vec<Rank> = ids.iter().filter_map(|id| model.rank(*id).cloned()).collect();
    assert_eq!(model.move_by(ids[2], 1).expect("move"), MoveOutcome::AtBoundary);
    assert_eq!(model.move_by(ids[0], -1).expect("move"), MoveOutcome::AtBoundary);
    assert_eq!(model.move_to_top(ids[2]).expect("move"), MoveOutcome::AtBoundary);
    assert_eq!(model.move_to_bottom(ids[0]).expect("move"), MoveOutcome::AtBoundary);
    let after: Vec<Rank> = ids.iter().filter_map(|id| model.rank(*id).cloned()).collect();
    assert_eq!(before, after);
}

#[test]
fn move_down_lands_between_neighbours() {
    let (mut model, ids) = model_with(4);
    model.move_by(ids[3], -2).expect("move");
    assert_eq!(model.ordered_ids(), &[ids[0], ids[3], ids[1], ids[2]]);
    assert_strictly_ordered(&model);
}

#[test]
fn move_clamps_large_delta() {
    let (mut model, ids) = model_with(3);
    model.move_by(ids[0], 100).expect("move");
    assert_eq!(model.ordered_ids(), &[ids[1], ids[2], ids[0]]);
}

#[test]
fn move_to_top_and_bottom() {
    let (mut model, ids) = model_with(4);
    model.move_to_top(ids[1]).expect("top");
    assert_eq!(model.nth(3), Some(ids[1]));
    model.move_to_bottom(ids[2]).expect("bottom");
    assert_eq!(model.ordered_ids(), &[ids[2], ids[0], ids[3], ids[1]]);
}

#[test]
fn move_only_touches_the_moved_rank() {
    let (mut model, ids) = model_with(5);
    let before: Vec<Option<Rank>> = ids.iter().map(|id| model.rank(*id).cloned()).collect();
    model.move_by(ids[1], 2).expect("move");
    for (i, id) in ids.iter().enumerate() {
        if i != 1 {
            assert_eq!(model.rank(*id).cloned(), before[i]);
        }
    }
}

#[test]
fn move_unknown_id_fails() {
    let (mut model, _) = model_with(1);
    assert!(matches!(model.move_by(Uuid::new_v4(), 1), Err(OrderError::NotFound(_))));
}

#[test]
fn tie_between_neighbours_breaks_below_upper() {
    let mut model = OrderModel::new();
    let mut dupes = [Uuid::new_v4(), Uuid::new_v4()];
    dupes.sort();
    let mover = Uuid::new_v4();
    model.write(mover, rank("a0"), Some("text"));
    model.write(dupes[0], rank("a5"), Some("text"));
    model.write(dupes[1], rank("a5"), Some("text"));

    // Target slot sits between the two duplicates.
    let outcome = model.move_by(mover, 1).expect("move");
    assert_eq!(outcome, MoveOutcome::Moved(rank("a4")));
}

#[test]
fn random_operations_never_produce_duplicates() {
    let mut rng = StdRng::seed_from_u64(42);
    let (mut model, mut ids) = model_with(5);
    for _ in 0..1500 {
        match rng.random_range(0..5) {
            0 => {
                let id = Uuid::new_v4();
                model.assign(id, "text").expect("assign");
                ids.push(id);
            }
            1 => {
                let id = ids[rng.random_range(0..ids.len())];
                let delta = rng.random_range(-2..=2);
                model.move_by(id, delta).expect("move");
            }
            2 => {
                model.move_to_top(ids[rng.random_range(0..ids.len())]).expect("top");
            }
            3 => {
                model.move_to_bottom(ids[rng.random_range(0..ids.len())]).expect("bottom");
            }
            _ => {
                let a = ids[rng.random_range(0..ids.len())];
                let b = ids[rng.random_range(0..ids.len())];
                let delta = if rng.random_bool(0.5) { 1 } else { -1 };
                model.move_group(&[a, b], delta).expect("group");
            }
        }
        assert!(model.collisions().is_empty());
    }
    assert_strictly_ordered(&model);
}

// =============================================================================
// group moves
// =============================================================================

#[test]
fn group_move_gathers_scattered_members_in_relative_order() {
    let (mut model, ids) = model_with(5);
    // Order: 0 1 2 3 4, group {1, 3}.
    let outcome = model.move_group(&[ids[3], ids[1]], 1).expect("group");
    let GroupMoveOutcome::Moved(placed) = outcome else {
        panic!("expected a move");
    };
    assert_eq!(placed.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![ids[1], ids[3]]);
    assert_eq!(model.ordered_ids(), &[ids[0], ids[2], ids[4], ids[1], ids[3]]);
    assert_strictly_ordered(&model);
}

#[test]
fn group_move_leaves_outsiders_untouched() {
    let (mut model, ids) = model_with(5);
    let outsiders = [ids[0], ids[2], ids[4]];
    let before: Vec<Option<Rank>> = outsiders.iter().map(|id| model.rank(*id).cloned()).collect();
    model.move_group(&[ids[1], ids[3]], -1).expect("group");
    let after: Vec<Option<Rank>> = outsiders.iter().map(|id| model.rank(*id).cloned()).collect();
    assert_eq!(before, after);
    assert_eq!(model.ordered_ids(), &[ids[1], ids[3], ids[0], ids[2], ids[4]]);
}

#[test]
fn group_up_then_down_restores_draw_order() {
    let (mut model, ids) = model_with(6);
    let group = [ids[2], ids[3]];
    let before = model.ordered_ids().to_vec();

    model.move_group(&group, 1).expect("up");
    assert_eq!(model.ordered_ids(), &[ids[0], ids[1], ids[4], ids[2], ids[3], ids[5]]);
    model.move_group(&group, -1).expect("down");

    assert_eq!(model.ordered_ids(), before.as_slice());
    assert_strictly_ordered(&model);
}

#[test]
fn group_at_extreme_signals_boundary() {
    let (mut model, ids) = model_with(4);
    assert_eq!(model.move_group(&[ids[2], ids[3]], 1).expect("group"), GroupMoveOutcome::AtBoundary);
    assert_eq!(model.move_group(&[ids[0]], -3).expect("group"), GroupMoveOutcome::AtBoundary);
}

#[test]
fn group_move_rejects_empty_and_unknown() {
    let (mut model, _) = model_with(2);
    assert_eq!(model.move_group(&[], 1), Err(OrderError::EmptyGroup));
    assert!(matches!(model.move_group(&[Uuid::new_v4()], 1), Err(OrderError::NotFound(_))));
}

#[test]
fn ordered_ids_of_kind_filters_by_type() {
    let mut model = OrderModel::new();
    let text = Uuid::new_v4();
    let image = Uuid::new_v4();
    model.assign(text, "text").expect("assign");
    model.assign(image, "image").expect("assign");
    assert_eq!(model.ordered_ids_of_kind("image"), vec![image]);
}

#[test]
fn free_rank_passes_through_unused_rank() {
    let mut model = OrderModel::new();
    let a = Uuid::new_v4();
    model.assign(a, "text").unwrap();
    let wanted = Rank::parse("b00").unwrap();
    assert_eq!(model.free_rank(Uuid::new_v4(), &wanted).unwrap(), wanted);
    assert_eq!(model.free_rank(a, &Rank::initial()).unwrap(), Rank::initial());
}

#[test]
fn free_rank_slots_above_taken_rank() {
    let mut model = OrderModel::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    model.assign(a, "text").unwrap();
    model.assign(b, "text").unwrap();
    let free = model.free_rank(Uuid::new_v4(), &Rank::initial()).unwrap();
    assert!(free > Rank::initial());
    assert!(free < *model.rank(b).unwrap());
}
