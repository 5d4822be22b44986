//! Event Generator - synthetic restaurant event stream
//!
//! Writes one JSON event per line to stdout (or a file), using the field names
//! real producers emit (`restaurant_id`, `restaurant_name`, item `price`) and
//! naive ISO-8601 timestamps. The stream carries the defects the pipeline must
//! absorb: duplicate deliveries, late re-deliveries, local reordering and a
//! trickle of malformed records.
//!
//! Usage:
//!   cargo run --bin event_generator -- batch [TABLES] [OUTPUT]   (seeded, default 100 tables)
//!   cargo run --bin event_generator -- stream [EVENTS_PER_SEC]   (default 10/sec, CTRL+C to stop)

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use dotenv::dotenv;
use log::{error, info};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, BufWriter, Write};
use tokio::time::{sleep, Duration};

const RESTAURANTS: [(&str, &str); 5] = [
    ("rest_001", "Downtown Location"),
    ("rest_002", "Westside Location"),
    ("rest_003", "Eastside Location"),
    ("rest_004", "Uptown Location"),
    ("rest_005", "Suburban Location"),
];

const MENU: [(&str, &[(&str, f64)]); 7] = [
    (
        "Pizza",
        &[
            ("Margherita Pizza", 18.99),
            ("Pepperoni Pizza", 20.99),
            ("Quattro Formaggi", 22.99),
            ("BBQ Chicken Pizza", 21.99),
            ("Veggie Supreme Pizza", 19.99),
        ],
    ),
    (
        "Pasta",
        &[
            ("Spaghetti Carbonara", 16.99),
            ("Fettuccine Alfredo", 17.99),
            ("Penne Arrabbiata", 15.99),
            ("Lasagna Bolognese", 19.99),
            ("Seafood Linguine", 24.99),
        ],
    ),
    (
        "Salad",
        &[
            ("Caesar Salad", 12.99),
            ("Greek Salad", 13.99),
            ("House Garden Salad", 10.99),
            ("Caprese Salad", 14.99),
        ],
    ),
    (
        "Appetizer",
        &[
            ("Garlic Bread", 7.99),
            ("Bruschetta", 9.99),
            ("Mozzarella Sticks", 10.99),
            ("Calamari", 13.99),
            ("Wings", 12.99),
        ],
    ),
    (
        "Entree",
        &[
            ("Grilled Salmon", 26.99),
            ("Ribeye Steak", 34.99),
            ("Chicken Parmesan", 21.99),
            ("Lamb Chops", 32.99),
            ("Eggplant Parmigiana", 18.99),
        ],
    ),
    (
        "Dessert",
        &[
            ("Tiramisu", 8.99),
            ("Chocolate Lava Cake", 9.99),
            ("Cheesecake", 8.99),
            ("Gelato", 6.99),
        ],
    ),
    (
        "Beverage",
        &[
            ("Soft Drink", 3.99),
            ("Iced Tea", 3.99),
            ("Sparkling Water", 4.99),
            ("Fresh Juice", 5.99),
            ("Coffee", 3.99),
        ],
    ),
];

const PARTY_SIZES: [u32; 5] = [2, 3, 4, 5, 6];
const PARTY_WEIGHTS: [u32; 5] = [35, 25, 25, 10, 5];
const TIP_RATES: [f64; 5] = [0.15, 0.18, 0.20, 0.22, 0.25];
const PAYMENT_METHODS: [&str; 4] = ["credit_card", "debit_card", "cash", "mobile_payment"];
const PAYMENT_WEIGHTS: [u32; 4] = [50, 25, 15, 10];
const TAX_RATE: f64 = 0.09;

const ORDER_RATE: f64 = 0.90;
const PAYMENT_RATE: f64 = 0.95;
const DUPLICATE_RATE: f64 = 0.05;
const LATE_REDELIVERY_RATE: f64 = 0.03;
const SHUFFLE_RATE: f64 = 0.10;
const MALFORMED_RATE: f64 = 0.001;

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Stable menu item id, independent of process or seed.
fn item_id(category: &str, item_name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    category.hash(&mut hasher);
    item_name.hash(&mut hasher);
    format!("item_{:05}", hasher.finish() % 100_000)
}

struct RestaurantEventGenerator {
    rng: StdRng,
    party_dist: WeightedIndex<u32>,
    payment_dist: WeightedIndex<u32>,
}

impl RestaurantEventGenerator {
    fn new(seed: Option<u64>) -> Result<Self, rand::distributions::WeightedError> {
        Ok(Self {
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            party_dist: WeightedIndex::new(PARTY_WEIGHTS)?,
            payment_dist: WeightedIndex::new(PAYMENT_WEIGHTS)?,
        })
    }

    fn uuid(&mut self) -> String {
        let v: u128 = self.rng.gen();
        let hex = format!("{:032x}", v);
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }

    fn base(&mut self, event_type: &str, ts: NaiveDateTime, rest: (&str, &str), table_id: &str) -> Value {
        json!({
            "event_id": self.uuid(),
            "event_type": event_type,
            "timestamp": ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            "restaurant_id": rest.0,
            "restaurant_name": rest.1,
            "table_id": table_id,
        })
    }

    /// One visit: seated, then usually an order, kitchen completion and payment.
    fn table_session(&mut self, seated_at: NaiveDateTime) -> Vec<Value> {
        let rest = RESTAURANTS[self.rng.gen_range(0..RESTAURANTS.len())];
        let table_id = format!("table_{:02}", self.rng.gen_range(1..=30));
        let server_id = format!("server_{}", self.rng.gen_range(100..=999));
        let order_id = format!("order_{}", &self.uuid()[..8]);
        let party_size = PARTY_SIZES[self.party_dist.sample(&mut self.rng)];

        let mut events = Vec::with_capacity(4);

        let mut seated = self.base("table_seated", seated_at, rest, &table_id);
        seated["party_size"] = json!(party_size);
        seated["server_id"] = json!(server_id);
        events.push(seated);

        if !self.rng.gen_bool(ORDER_RATE) {
            return events;
        }

        let ordered_at = seated_at + ChronoDuration::minutes(self.rng.gen_range(5..=15));
        let mut items = Vec::new();
        let mut subtotal = 0.0;
        for _ in 0..self.rng.gen_range(2..=6) {
            let (category, dishes) = MENU[self.rng.gen_range(0..MENU.len())];
            let (name, price) = dishes[self.rng.gen_range(0..dishes.len())];
            let quantity: u32 = if self.rng.gen_bool(0.85) { 1 } else { 2 };
            subtotal += price * quantity as f64;
            items.push(json!({
                "item_id": item_id(category, name),
                "item_name": name,
                "category": category,
                "price": price,
                "quantity": quantity,
            }));
        }
        let subtotal = round2(subtotal);

        let mut placed = self.base("order_placed", ordered_at, rest, &table_id);
        placed["server_id"] = json!(server_id);
        placed["order_id"] = json!(order_id);
        placed["items"] = json!(items);
        placed["subtotal"] = json!(subtotal);
        events.push(placed);

        let kitchen_minutes = self.rng.gen_range(15..=35);
        let completed_at = ordered_at + ChronoDuration::minutes(kitchen_minutes);
        let mut completed = self.base("order_completed", completed_at, rest, &table_id);
        completed["order_id"] = json!(order_id);
        completed["kitchen_time_minutes"] = json!(kitchen_minutes);
        events.push(completed);

        if !self.rng.gen_bool(PAYMENT_RATE) {
            return events;
        }

        let paid_at = completed_at + ChronoDuration::minutes(self.rng.gen_range(10..=25));
        let tax = round2(subtotal * TAX_RATE);
        let tip = round2(subtotal * TIP_RATES[self.rng.gen_range(0..TIP_RATES.len())]);
        let mut payment = self.base("payment", paid_at, rest, &table_id);
        payment["order_id"] = json!(order_id);
        payment["subtotal"] = json!(subtotal);
        payment["tax"] = json!(tax);
        payment["tip"] = json!(tip);
        payment["total_amount"] = json!(round2(subtotal + tax + tip));
        payment["payment_method"] = json!(PAYMENT_METHODS[self.payment_dist.sample(&mut self.rng)]);
        events.push(payment);

        events
    }

    /// Duplicates, late re-deliveries, a local shuffle and rare malformed records.
    fn introduce_issues(&mut self, events: Vec<Value>) -> Vec<Value> {
        let mut out = Vec::with_capacity(events.len() + 2);
        for event in events {
            let duplicate = self.rng.gen_bool(DUPLICATE_RATE);
            let late = self.rng.gen_bool(LATE_REDELIVERY_RATE);
            if self.rng.gen_bool(MALFORMED_RATE) {
                let mut broken = event.clone();
                if let Some(obj) = broken.as_object_mut() {
                    obj.remove("event_type");
                }
                out.push(broken);
            }
            out.push(event.clone());
            if duplicate {
                out.push(event.clone());
            }
            if late {
                out.push(event);
            }
        }

        if out.len() > 2 && self.rng.gen_bool(SHUFFLE_RATE) {
            let start = self.rng.gen_range(0..out.len() - 1);
            let end = (start + self.rng.gen_range(2..=5)).min(out.len());
            out[start..end].shuffle(&mut self.rng);
        }
        out
    }
}

fn write_events(out: &mut impl Write, events: &[Value]) -> io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut *out, event)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn generate_batch(tables: usize, output: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut generator = RestaurantEventGenerator::new(Some(42))?;
    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let start = Utc::now().naive_utc();
    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0;

    for i in 0..tables {
        // Spread seatings over the last few hours.
        let seated_at = start - ChronoDuration::minutes(((tables - i) * 2) as i64);
        let session = generator.table_session(seated_at);
        let events = generator.introduce_issues(session);
        for e in &events {
            let t = e["event_type"].as_str().unwrap_or("malformed").to_string();
            *by_type.entry(t).or_insert(0) += 1;
        }
        total += events.len();
        write_events(&mut out, &events)?;
    }
    out.flush()?;

    info!(
        "✅ Generated {} events from {} table sessions{}",
        total,
        tables,
        output.map(|p| format!(" → {}", p)).unwrap_or_default()
    );
    for (event_type, count) in by_type {
        info!("   ├─ {}: {}", event_type, count);
    }
    Ok(())
}

async fn generate_stream(events_per_sec: f64) -> Result<(), Box<dyn std::error::Error>> {
    let mut generator = RestaurantEventGenerator::new(None)?;
    let started = std::time::Instant::now();
    let mut count = 0u64;

    info!("🚀 Streaming restaurant events at {} events/sec (stdout)", events_per_sec);

    loop {
        let session = generator.table_session(Utc::now().naive_utc());
        let events = generator.introduce_issues(session);
        {
            let mut out = io::stdout().lock();
            if let Err(e) = write_events(&mut out, &events).and_then(|_| out.flush()) {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    info!("Consumer closed the pipe after {} events", count);
                    return Ok(());
                }
                return Err(e.into());
            }
        }

        let before = count;
        count += events.len() as u64;
        if count / 100 > before / 100 {
            let rate = count as f64 / started.elapsed().as_secs_f64().max(1e-9);
            info!("📊 Progress: {} events, {:.1} events/sec", count, rate);
        }

        let pause = Duration::from_secs_f64(events.len() as f64 / events_per_sec);
        tokio::select! {
            _ = sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Stopped. Generated {} events", count);
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("batch") => {
            let tables = match args.get(1) {
                Some(n) => n.parse()?,
                None => 100,
            };
            generate_batch(tables, args.get(2).cloned())
        }
        Some("stream") | None => {
            let rate: f64 = match args.get(1) {
                Some(r) => r.parse()?,
                None => 10.0,
            };
            if !(rate > 0.0) {
                return Err("EVENTS_PER_SEC must be positive".into());
            }
            generate_stream(rate).await
        }
        Some(other) => Err(format!("unknown mode '{}' (expected batch or stream)", other).into()),
    };

    if let Err(e) = &result {
        error!("❌ Event generator failed: {}", e);
    }
    result
}
