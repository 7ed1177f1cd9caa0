//! Integration tests for the reflection surface
//!
//! Tests cover:
//! - Object enumeration and path lookups
//! - Field reads and writes across property kinds
//! - Dynamic arrays and nested structs through views
//! - Typed access and error reporting

use std::sync::Arc;

use ureflect_engine::props::{ByteProperty, FloatProperty, IntProperty, NameProperty, StrProperty};
use ureflect_engine::testing::{CountingAllocator, FakeHost, FieldSpec};
use ureflect_engine::{ObjectRef, ReflectError, StructView, TypeRef, Value};

const MAP: &str = "/Game/Maps/Arena";

struct Fixture {
    fake: FakeHost,
    item: TypeRef,
    player: TypeRef,
    weapon: TypeRef,
    hero: ObjectRef,
    sword: ObjectRef,
}

fn fixture() -> Fixture {
    let mut fake = FakeHost::new();
    let item = fake
        .script_struct("Item")
        .package("/Script/Game")
        .field("Label", FieldSpec::Str)
        .field("Count", FieldSpec::Int32)
        .finish();
    let weapon = fake.class("Weapon").package("/Script/Game").finish();
    let player = fake
        .class("Player")
        .package("/Script/Game")
        .field("Health", FieldSpec::Int32)
        .field("bAlive", FieldSpec::Bool)
        .field("bCrouched", FieldSpec::Bool)
        .field("Level", FieldSpec::UInt8)
        .field("Speed", FieldSpec::Float32)
        .field("Title", FieldSpec::Str)
        .field("Tag", FieldSpec::Name)
        .field("Scores", FieldSpec::Array(Box::new(FieldSpec::Int32)))
        .field("Held", FieldSpec::Object(weapon))
        .field("Bag", FieldSpec::Array(Box::new(FieldSpec::Struct(item))))
        .field("Best", FieldSpec::Struct(item))
        .finish();
    let level = fake.class("Level").package("/Script/Game").finish();

    let package = fake.core().package;
    let map = fake.spawn(package, MAP, None);
    let world = fake.spawn(level, "World", Some(map));
    let hero = fake.spawn(player, "Hero", Some(world));
    fake.spawn(player, "Sidekick", Some(world));
    let sword = fake.spawn(weapon, "Sword", Some(world));

    Fixture {
        fake,
        item,
        player,
        weapon,
        hero,
        sword,
    }
}

#[test]
fn test_enumerate_and_resolve_paths() {
    let f = fixture();
    let host = f.fake.host();

    let players = host.instances_of(f.player);
    assert_eq!(players.len(), 2);
    assert!(players.contains(&f.hero));

    assert_eq!(host.path_name(f.hero).unwrap(), "/Game/Maps/Arena.World:Hero");
    assert_eq!(host.find_object("/Game/Maps/Arena.World:Hero").unwrap(), f.hero);
    assert_eq!(host.find_object("/Script/Game.Player").unwrap(), f.player.object());
    assert!(matches!(
        host.find_object("/Game/Maps/Arena.World:Nobody"),
        Err(ReflectError::NotFound { .. })
    ));

    assert_eq!(host.find_type("Player").unwrap(), f.player);
    assert_eq!(host.find_type_by_path("/Script/Game.Weapon").unwrap(), f.weapon);
}

#[test]
fn test_scalar_fields_round_trip_through_host_memory() {
    let f = fixture();
    let host = f.fake.host();

    host.set_field(f.hero, "Health", &Value::Int(75)).unwrap();
    host.set_field(f.hero, "bCrouched", &Value::Bool(true)).unwrap();
    host.set_field(f.hero, "Level", &Value::Int(12)).unwrap();
    host.set_field(f.hero, "Speed", &Value::Float(1.5)).unwrap();

    assert_eq!(host.get_as::<IntProperty>(f.hero, "Health").unwrap(), 75);
    assert_eq!(host.get_field(f.hero, "bAlive").unwrap().as_bool(), Some(false));
    assert_eq!(host.get_field(f.hero, "bCrouched").unwrap().as_bool(), Some(true));
    assert_eq!(host.get_as::<ByteProperty>(f.hero, "Level").unwrap(), 12);
    assert_eq!(host.get_field(f.hero, "Speed").unwrap().as_f64(), Some(1.5));

    let err = host.set_field(f.hero, "Level", &Value::Int(300)).unwrap_err();
    assert!(matches!(err, ReflectError::OutOfRange { .. }));
    assert_eq!(host.get_as::<ByteProperty>(f.hero, "Level").unwrap(), 12);

    let err = host.set_field(f.hero, "Health", &Value::from("lots")).unwrap_err();
    assert!(matches!(err, ReflectError::TypeMismatch { .. }));
    assert!(matches!(
        host.get_field(f.hero, "Mana"),
        Err(ReflectError::NotFound { .. })
    ));
}

#[test]
fn test_typed_set_with_wrong_kind_leaves_memory_untouched() {
    let f = fixture();
    let host = f.fake.host();
    host.set_field(f.hero, "Health", &Value::Int(75)).unwrap();
    host.set_field(f.hero, "Speed", &Value::Float(2.5)).unwrap();

    let offset = host.find_field(f.player, "Health").unwrap().offset;
    let health_bytes =
        || unsafe { std::ptr::read_unaligned((f.hero.addr() + offset) as *const [u8; 4]) };
    let before = health_bytes();

    let err = host
        .set_as::<StrProperty>(f.hero, "Health", "lots".to_string())
        .unwrap_err();
    assert_eq!(err, ReflectError::mismatch("StrProperty", "IntProperty"));
    let err = host.set_as::<FloatProperty>(f.hero, "Health", 1.0).unwrap_err();
    assert_eq!(err, ReflectError::mismatch("FloatProperty", "IntProperty"));
    assert_eq!(health_bytes(), before);
    assert_eq!(host.get_as::<IntProperty>(f.hero, "Health").unwrap(), 75);

    let view = host.object_view(f.hero).unwrap();
    let err = view.set_as::<ByteProperty>("Speed", 3).unwrap_err();
    assert_eq!(err, ReflectError::mismatch("ByteProperty", "FloatProperty"));
    assert_eq!(view.get_as::<FloatProperty>("Speed").unwrap(), 2.5);
}

#[test]
fn test_string_of_exactly_current_capacity() {
    let f = fixture();
    let host = f.fake.host();

    host.set_field(f.hero, "Title", &Value::from("Knight")).unwrap();
    let offset = host.find_field(f.player, "Title").unwrap().offset;
    // { data, count: i32, capacity: i32 }
    let header = f.hero.addr() + offset;
    let (data, capacity) = unsafe {
        (
            std::ptr::read_unaligned(header as *const usize),
            std::ptr::read_unaligned((header + 12) as *const i32),
        )
    };
    assert_eq!(capacity, 7);

    host.set_field(f.hero, "Title", &Value::from("Archer")).unwrap();
    assert_eq!(host.get_field(f.hero, "Title").unwrap().as_str(), Some("Archer"));
    unsafe {
        assert_eq!(std::ptr::read_unaligned(header as *const usize), data);
        assert_eq!(std::ptr::read_unaligned((header + 8) as *const i32), 7);
    }
}

#[test]
fn test_strings_and_names() {
    let f = fixture();
    let host = f.fake.host();

    host.set_as::<StrProperty>(f.hero, "Title", "Dragonslayer".to_string())
        .unwrap();
    assert_eq!(host.get_field(f.hero, "Title").unwrap().as_str(), Some("Dragonslayer"));
    host.set_field(f.hero, "Title", &Value::from("")).unwrap();
    assert_eq!(host.get_field(f.hero, "Title").unwrap().as_str(), Some(""));

    host.set_field(f.hero, "Tag", &Value::from("Sidekick")).unwrap();
    let tag = host.get_as::<NameProperty>(f.hero, "Tag").unwrap();
    assert_eq!(host.names().resolve(tag).unwrap(), "Sidekick");
    assert!(matches!(
        host.set_field(f.hero, "Tag", &Value::from("NeverInterned")),
        Err(ReflectError::NotFound { .. })
    ));
}

#[test]
fn test_object_reference_field() {
    let f = fixture();
    let host = f.fake.host();

    host.set_field(f.hero, "Held", &Value::Object(Some(f.sword))).unwrap();
    assert_eq!(host.get_field(f.hero, "Held").unwrap().as_object(), Some(f.sword));

    let err = host
        .set_field(f.hero, "Held", &Value::Object(Some(f.hero)))
        .unwrap_err();
    assert_eq!(err, ReflectError::mismatch("Weapon", "Player"));
}

#[test]
fn test_dynamic_array_of_ints() {
    let f = fixture();
    let host = f.fake.host();

    let scores = host.get_field(f.hero, "Scores").unwrap();
    let scores = scores.as_array().unwrap();
    assert!(scores.is_empty());

    for n in [10, 20, 30] {
        scores.push(&Value::Int(n)).unwrap();
    }
    scores.set(1, &Value::Int(25)).unwrap();
    let values: Vec<_> = scores.to_vec().unwrap().iter().map(|v| v.as_i64()).collect();
    assert_eq!(values, [Some(10), Some(25), Some(30)]);
    assert!(matches!(
        scores.get(3),
        Err(ReflectError::OutOfBounds { index: 3, size: 3 })
    ));

    // a fresh read sees the same host storage
    let again = host.get_field(f.hero, "Scores").unwrap();
    assert_eq!(again.as_array().unwrap().len(), 3);

    host.set_field(f.hero, "Scores", &Value::List(vec![Value::Int(1)]))
        .unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores.pop().unwrap().and_then(|v| v.as_i64()), Some(1));
    assert!(scores.is_empty());
}

#[test]
fn test_nested_struct_and_struct_array() {
    let f = fixture();
    let host = f.fake.host();

    let best = host.get_field(f.hero, "Best").unwrap();
    let best = best.as_struct().unwrap();
    assert!(!best.is_owning());
    best.set("Label", &Value::from("crown")).unwrap();
    best.set("Count", &Value::Int(1)).unwrap();

    let reread = host.get_field(f.hero, "Best").unwrap();
    assert_eq!(reread.as_struct().unwrap().get("Label").unwrap().as_str(), Some("crown"));

    let potion = StructView::new(host.clone(), f.item).unwrap();
    potion.set("Label", &Value::from("potion")).unwrap();
    potion.set("Count", &Value::Int(3)).unwrap();

    let bag = host.get_field(f.hero, "Bag").unwrap();
    let bag = bag.as_array().unwrap();
    bag.push(&Value::Struct(potion.clone())).unwrap();
    bag.push(&Value::Struct(best.clone())).unwrap();

    // stored by value: later edits to the source do not reach the bag
    potion.set("Label", &Value::from("empty flask")).unwrap();
    let first = bag.get(0).unwrap();
    let first = first.as_struct().unwrap();
    assert_eq!(first.get("Label").unwrap().as_str(), Some("potion"));
    assert_eq!(first.get("Count").unwrap().as_i64(), Some(3));
    let second = bag.get(1).unwrap();
    assert_eq!(second.as_struct().unwrap().get("Label").unwrap().as_str(), Some("crown"));
}

#[test]
fn test_owning_views_release_host_memory() {
    let f = fixture();
    let counter = Arc::new(CountingAllocator::default());
    let host = f.fake.host_with_allocator(counter.clone());

    {
        let loot = StructView::new(host.clone(), f.item).unwrap();
        loot.set("Label", &Value::from("gold")).unwrap();
        assert!(counter.live() >= 2);

        let copy = loot.to_owned_copy().unwrap();
        drop(loot);
        assert_eq!(copy.get("Label").unwrap().as_str(), Some("gold"));
    }
    assert_eq!(counter.live(), 0);
}

#[test]
fn test_object_view_lists_inherited_fields() {
    let mut fake = FakeHost::new();
    let base = fake.class("Base").field("Id", FieldSpec::Int64).finish();
    let derived = fake
        .class("Derived")
        .parent(base)
        .field("Extra", FieldSpec::UInt16)
        .finish();
    let obj = fake.spawn(derived, "D", None);
    let host = fake.host();

    let view = host.object_view(obj).unwrap();
    assert_eq!(view.as_object(), Some(obj));
    let names = view.field_names();
    assert!(names.contains(&"Id".to_string()));
    assert!(names.contains(&"Extra".to_string()));

    view.set("Id", &Value::Int(-9)).unwrap();
    assert_eq!(host.get_field(obj, "Id").unwrap().as_i64(), Some(-9));
}
