//! Script access to host struct fields

mod common;

use common::new_state;
use luabridge::{expose_fields, FieldValue, Opaque, State};

#[derive(Default)]
struct Player {
    name: String,
    level: u8,
    score: i64,
    balance: u64,
    speed: f64,
    alive: bool,
    avatar: Vec<u8>,
    guild: Option<String>,
    inventory: Opaque<Vec<String>>,
}

expose_fields!(Player {
    name, level, score, balance, speed, alive, avatar, guild, inventory
});

fn with_player(state: &State) -> luabridge::SharedStruct {
    let player = state.push_struct(Player {
        name: "ada".into(),
        level: 3,
        score: -40,
        balance: 1000,
        speed: 1.5,
        alive: true,
        avatar: vec![0, 159, 255],
        guild: None,
        inventory: Opaque(vec!["sword".into()]),
    });
    state.set_global("player").unwrap();
    player
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn test_read_fields() {
    let state = new_state();
    with_player(&state);
    state
        .do_string(
            "return player.name, player.level, player.score, player.speed, player.alive, player.guild",
        )
        .unwrap();
    assert_eq!(state.to_string(1).as_deref(), Some("ada"));
    assert_eq!(state.to_integer(2), 3);
    assert_eq!(state.to_integer(3), -40);
    assert_eq!(state.to_number(4), 1.5);
    assert!(state.to_boolean(5));
    assert!(state.is_nil(6));
    state.close().unwrap();
}

#[test]
fn test_bytes_field_is_binary_string() {
    let state = new_state();
    with_player(&state);
    state
        .do_string("return #player.avatar, string.byte(player.avatar, 2)")
        .unwrap();
    assert_eq!(state.to_integer(1), 3);
    assert_eq!(state.to_integer(2), 159);
    state.close().unwrap();
}

#[test]
fn test_integer_field_keeps_integer_subtype() {
    let state = new_state();
    with_player(&state);
    state.do_string("return math.type(player.score)").unwrap();
    assert_eq!(state.to_string(-1).as_deref(), Some("integer"));
    state.close().unwrap();
}

// ============================================================================
// Writes
// ============================================================================

#[test]
fn test_write_fields_visible_to_host() {
    let state = new_state();
    let player = with_player(&state);
    state
        .do_string(
            r#"
            player.name = "grace"
            player.level = 42
            player.score = 7
            player.speed = 2
            player.alive = false
            player.guild = "night watch"
            player.avatar = "\1\2"
            "#,
        )
        .unwrap();

    let player = player.lock();
    assert_eq!(
        player.get_field("name").unwrap(),
        FieldValue::String("grace".into())
    );
    assert_eq!(player.get_field("level").unwrap(), FieldValue::Uint(42));
    assert_eq!(player.get_field("score").unwrap(), FieldValue::Int(7));
    assert_eq!(player.get_field("speed").unwrap(), FieldValue::Float(2.0));
    assert_eq!(player.get_field("alive").unwrap(), FieldValue::Bool(false));
    assert_eq!(
        player.get_field("guild").unwrap(),
        FieldValue::String("night watch".into())
    );
    assert_eq!(player.get_field("avatar").unwrap(), FieldValue::Bytes(vec![1, 2]));
    drop(player);
    state.close().unwrap();
}

#[test]
fn test_host_changes_visible_to_script() {
    let state = new_state();
    let player = with_player(&state);
    player
        .lock()
        .set_field("score", FieldValue::Int(99))
        .unwrap();
    state.do_string("return player.score").unwrap();
    assert_eq!(state.to_integer(-1), 99);
    state.close().unwrap();
}

#[test]
fn test_wrong_type_assignment_rejected() {
    let state = new_state();
    let player = with_player(&state);

    let err = state.do_string("player.level = 'high'").unwrap_err();
    assert_eq!(err.message, "Wrong assignment to field level");
    assert_eq!(player.lock().get_field("level").unwrap(), FieldValue::Uint(3));

    let err = state.do_string("player.alive = 1").unwrap_err();
    assert_eq!(err.message, "Wrong assignment to field alive");
    state.close().unwrap();
}

#[test]
fn test_out_of_range_assignment_rejected() {
    let state = new_state();
    let player = with_player(&state);

    let err = state.do_string("player.level = 300").unwrap_err();
    assert_eq!(err.message, "Wrong assignment to field level");
    let err = state.do_string("player.level = 2.5").unwrap_err();
    assert_eq!(err.message, "Wrong assignment to field level");
    let err = state.do_string("player.balance = 'lots'").unwrap_err();
    assert_eq!(err.message, "Wrong assignment to field balance");

    state.do_string("player.level = 4.0").unwrap();
    assert_eq!(player.lock().get_field("level").unwrap(), FieldValue::Uint(4));
    state.close().unwrap();
}

#[test]
fn test_unsupported_field() {
    let state = new_state();
    with_player(&state);

    let err = state.do_string("return player.inventory").unwrap_err();
    assert!(
        err.message.starts_with("Unsupported type of field inventory"),
        "{}",
        err.message
    );
    let err = state.do_string("player.inventory = {}").unwrap_err();
    assert!(err.message.starts_with("Unsupported type of field inventory"));
    state.close().unwrap();
}

#[test]
fn test_unknown_field() {
    let state = new_state();
    with_player(&state);
    let err = state.do_string("return player.mana").unwrap_err();
    assert_eq!(err.message, "Unknown field mana");
    let err = state.do_string("player.mana = 1").unwrap_err();
    assert_eq!(err.message, "Unknown field mana");
    state.close().unwrap();
}

#[test]
fn test_non_string_key_rejected() {
    let state = new_state();
    with_player(&state);
    let err = state.do_string("return player[1]").unwrap_err();
    assert_eq!(err.message, "Field name must be a string");
    state.close().unwrap();
}

#[test]
fn test_struct_userdata_roundtrip() {
    let state = new_state();
    let player = with_player(&state);
    state.get_global("player").unwrap();
    assert!(state.is_host_struct(-1));
    let back = state.to_host_struct(-1).unwrap();
    assert!(std::sync::Arc::ptr_eq(&player, &back));
    state.close().unwrap();
}
