use super::schema::{FieldKind, FieldSpec, LowStockFlag, RecordSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SPECIES: &[&str] = &["dog", "cat", "bird", "other"];
const ACCESSORY_TYPES: &[&str] = &["toy", "food", "collar", "bedding", "grooming", "other"];
const SIZES: &[&str] = &["S", "M", "L", "XL"];
const ACTIVITY_TYPES: &[&str] = &["feed", "walk", "play", "vet", "train"];

const fn text(min_len: usize, max_len: usize) -> FieldKind {
    FieldKind::Text {
        min_len,
        max_len: Some(max_len),
    }
}

const URL: FieldKind = FieldKind::Text {
    min_len: 0,
    max_len: None,
};

const SCORE: FieldKind = FieldKind::Integer {
    min: 0,
    max: Some(100),
};

static PET_FIELDS: [FieldSpec; 8] = [
    FieldSpec::required("name", text(1, 100)),
    FieldSpec::required("species", FieldKind::Category(SPECIES)),
    FieldSpec::required(
        "ageYears",
        FieldKind::Integer {
            min: 0,
            max: Some(50),
        },
    ),
    FieldSpec::required("health", SCORE),
    FieldSpec::required("happiness", SCORE),
    FieldSpec::required("energy", SCORE),
    FieldSpec::optional("avatarUrl", URL),
    FieldSpec::optional("notes", text(0, 1000)),
];

static ACCESSORY_FIELDS: [FieldSpec; 7] = [
    FieldSpec::required("name", text(1, 200)),
    FieldSpec::required("type", FieldKind::Category(ACCESSORY_TYPES)),
    FieldSpec::required("price", FieldKind::Number { min: 0.0 }),
    FieldSpec::required("stock", FieldKind::Integer { min: 0, max: None }),
    FieldSpec::optional("size", FieldKind::Category(SIZES)),
    FieldSpec::optional("imageUrl", URL),
    FieldSpec::optional("description", text(0, 2000)),
];

static ACTIVITY_FIELDS: [FieldSpec; 4] = [
    FieldSpec::required("petId", text(1, 100)),
    FieldSpec::required("type", FieldKind::Category(ACTIVITY_TYPES)),
    FieldSpec::required("timestamp", FieldKind::Timestamp),
    FieldSpec::optional("notes", text(0, 1000)),
];

fn pet_seeds() -> Vec<Value> {
    vec![
        json!({
            "id": "p1", "name": "Luna", "species": "dog", "ageYears": 3,
            "health": 82, "happiness": 91, "energy": 76,
            "avatarUrl": "", "notes": "Loves fetch"
        }),
        json!({
            "id": "p2", "name": "Milo", "species": "cat", "ageYears": 2,
            "health": 88, "happiness": 73, "energy": 65,
            "avatarUrl": "", "notes": "Window watcher"
        }),
        json!({
            "id": "p3", "name": "Pico", "species": "bird", "ageYears": 1,
            "health": 75, "happiness": 80, "energy": 90,
            "avatarUrl": "", "notes": "Chirpy"
        }),
    ]
}

fn accessory_seeds() -> Vec<Value> {
    vec![
        json!({
            "id": "x1", "name": "Chew Toy", "type": "toy", "price": 8.99, "stock": 12,
            "size": "M", "imageUrl": "", "description": "Durable rope"
        }),
        json!({
            "id": "x2", "name": "Salmon Treats", "type": "food", "price": 5.49, "stock": 3,
            "size": "S", "imageUrl": "", "description": "Soft chews"
        }),
    ]
}

fn activity_seeds() -> Vec<Value> {
    vec![
        json!({
            "id": "a1", "petId": "p1", "type": "walk",
            "timestamp": "2025-10-05T08:30:00.000000Z", "notes": "Park loop"
        }),
        json!({
            "id": "a2", "petId": "p2", "type": "feed",
            "timestamp": "2025-10-05T07:00:00.000000Z", "notes": "Tuna pouch"
        }),
        json!({
            "id": "a3", "petId": "p1", "type": "play",
            "timestamp": "2025-10-04T18:00:00.000000Z", "notes": "Frisbee"
        }),
    ]
}

pub static PETS: RecordSchema = RecordSchema {
    name: "pets",
    default_database: "petservice",
    default_container: "pets",
    fields: &PET_FIELDS,
    search_fields: &["name", "notes"],
    filter_fields: &["species"],
    low_stock: None,
    range_field: None,
    seeds: pet_seeds,
};

pub static ACCESSORIES: RecordSchema = RecordSchema {
    name: "accessories",
    default_database: "accessoryservice",
    default_container: "accessories",
    fields: &ACCESSORY_FIELDS,
    search_fields: &["name", "description"],
    filter_fields: &["type"],
    low_stock: Some(LowStockFlag {
        field: "stock",
        threshold: 10,
    }),
    range_field: None,
    seeds: accessory_seeds,
};

pub static ACTIVITIES: RecordSchema = RecordSchema {
    name: "activities",
    default_database: "activityservice",
    default_container: "activities",
    fields: &ACTIVITY_FIELDS,
    search_fields: &["notes"],
    filter_fields: &["petId", "type"],
    low_stock: None,
    range_field: Some("timestamp"),
    seeds: activity_seeds,
};

/// Built-in record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Pets,
    Accessories,
    Activities,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [
        RecordType::Pets,
        RecordType::Accessories,
        RecordType::Activities,
    ];

    pub fn schema(&self) -> &'static RecordSchema {
        match self {
            RecordType::Pets => &PETS,
            RecordType::Accessories => &ACCESSORIES,
            RecordType::Activities => &ACTIVITIES,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.schema().name)
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pets" | "pet" => Ok(RecordType::Pets),
            "accessories" | "accessory" => Ok(RecordType::Accessories),
            "activities" | "activity" => Ok(RecordType::Activities),
            _ => Err(format!(
                "Unknown record type: {}. Expected one of: pets, accessories, activities",
                s
            )),
        }
    }
}
