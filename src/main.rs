//! Workload driver for the durable sets.
//!
//! Spawns one thread per writer identity, each running a pre-generated
//! stream of insert/remove/contains operations against the chosen set
//! variant, then checks that the per-thread insert/remove deltas add up to
//! the final set size.
//!
//! ```bash
//! duraset <numOps> <insertChance> <removeChance> [variant]
//! ```
//!
//! - `numOps`: operations per thread, 5..=150000
//! - `insertChance`: inserts out of 10, 3..=10
//! - `removeChance`: removes out of 10, 0..=6 (insert + remove <= 10)
//! - `variant`: `sequential`, `lock`, `mrlock` (default), `linkfree`, `soft`

#![allow(clippy::expect_used)]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::env;
use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::Rng;

use duraset::store::{DurableStore, MaskStore, SoftStore};
use duraset::{DurableSet, LinkFreeSet, LockSet, MrLockSet, SequentialSet, SoftSet, WriterId};

/// Writer identities, one thread each.
const NUM_THREADS: usize = 4;

/// Items are drawn uniformly from `0..=ITEM_RANGE`.
const ITEM_RANGE: i64 = 10;

// =============================================================================
// Argument parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Sequential,
    Lock,
    MrLock,
    LinkFree,
    Soft,
}

impl Variant {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sequential" => Some(Self::Sequential),
            "lock" => Some(Self::Lock),
            "mrlock" => Some(Self::MrLock),
            "linkfree" => Some(Self::LinkFree),
            "soft" => Some(Self::Soft),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Lock => "lock",
            Self::MrLock => "mrlock",
            Self::LinkFree => "linkfree",
            Self::Soft => "soft",
        }
    }
}

#[derive(Debug)]
enum ArgError {
    WrongCount,
    NotAPositiveInteger,
    NumOpsRange,
    InsertChanceRange,
    RemoveChanceRange,
    ChanceSum,
    UnknownVariant(String),
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongCount => {
                write!(f, "usage: duraset <numOps> <insertChance> <removeChance> [variant]")
            }
            Self::NotAPositiveInteger => write!(f, "one of the arguments is not a positive integer"),
            Self::NumOpsRange => write!(f, "numOps must be an integer from 5 to 150000"),
            Self::InsertChanceRange => write!(f, "insertChance must be an integer from 3 to 10"),
            Self::RemoveChanceRange => write!(f, "removeChance must be an integer from 0 to 6"),
            Self::ChanceSum => write!(f, "insertChance + removeChance must not exceed 10"),
            Self::UnknownVariant(name) => write!(
                f,
                "unknown variant {name:?} (expected sequential, lock, mrlock, linkfree or soft)"
            ),
        }
    }
}

struct DriverConfig {
    num_ops: usize,
    insert_chance: u32,
    /// Upper bound of the remove band: a control value in
    /// `insert_chance+1..=remove_bound` selects a remove.
    remove_bound: u32,
    variant: Variant,
}

fn parse_args(args: &[String]) -> Result<DriverConfig, ArgError> {
    if args.len() < 3 || args.len() > 4 {
        return Err(ArgError::WrongCount);
    }
    let numbers: Vec<u32> = args[..3]
        .iter()
        .map(|arg| arg.parse::<u32>().map_err(|_| ArgError::NotAPositiveInteger))
        .collect::<Result<_, _>>()?;

    let (num_ops, insert_chance, remove_chance) = (numbers[0], numbers[1], numbers[2]);
    if !(5..=150_000).contains(&num_ops) {
        return Err(ArgError::NumOpsRange);
    }
    if !(3..=10).contains(&insert_chance) {
        return Err(ArgError::InsertChanceRange);
    }
    if remove_chance > 6 {
        return Err(ArgError::RemoveChanceRange);
    }
    if insert_chance + remove_chance > 10 {
        return Err(ArgError::ChanceSum);
    }
    let variant = match args.get(3) {
        Some(name) => Variant::parse(name).ok_or_else(|| ArgError::UnknownVariant(name.clone()))?,
        None => Variant::MrLock,
    };
    Ok(DriverConfig {
        num_ops: num_ops as usize,
        insert_chance,
        remove_bound: insert_chance + remove_chance,
        variant,
    })
}

// =============================================================================
// Workload generation
// =============================================================================

/// One thread's pre-generated operation stream.
struct OpStream {
    /// Uniform draws from 1..=10 deciding insert/remove/contains.
    controls: Vec<u32>,
    /// Uniform draws from 0..=ITEM_RANGE.
    items: Vec<i64>,
}

fn generate_streams(num_ops: usize) -> Vec<OpStream> {
    let mut rng = rand::rng();
    (0..NUM_THREADS)
        .map(|_| OpStream {
            controls: (0..num_ops).map(|_| rng.random_range(1..=10)).collect(),
            items: (0..num_ops).map(|_| rng.random_range(0..=ITEM_RANGE)).collect(),
        })
        .collect()
}

/// Per-thread write budgets: the number of insert decisions in the stream
/// upper-bounds that thread's successful inserts.
fn write_budgets(streams: &[OpStream], insert_chance: u32) -> Vec<usize> {
    streams
        .iter()
        .map(|stream| {
            stream
                .controls
                .iter()
                .filter(|&&control| control <= insert_chance)
                .count()
        })
        .collect()
}

/// One-to-one item-to-key mapping.
fn hash(item: i64) -> i64 {
    item
}

// =============================================================================
// Execution
// =============================================================================

/// Run one thread's stream; returns the insert/remove delta.
fn run_stream<S: DurableSet<i64>>(
    set: &S,
    stream: &OpStream,
    writer: WriterId,
    config: &DriverConfig,
) -> i64 {
    let mut delta = 0_i64;
    for (&control, &item) in stream.controls.iter().zip(&stream.items) {
        if control <= config.insert_chance {
            if set.insert(hash(item), item, writer) {
                delta += 1;
            }
        } else if control <= config.remove_bound {
            if set.remove(hash(item), writer) {
                delta -= 1;
            }
        } else {
            set.contains(hash(item));
        }
    }
    delta
}

/// Run the full workload on a concurrent set; returns (delta, size).
fn run_concurrent<S, F>(set: &S, streams: &[OpStream], config: &DriverConfig, len: F) -> (i64, usize)
where
    S: DurableSet<i64> + Sync,
    F: FnOnce(&S) -> usize,
{
    let delta = thread::scope(|scope| {
        let handles: Vec<_> = streams
            .iter()
            .enumerate()
            .map(|(writer, stream)| {
                scope.spawn(move || run_stream(set, stream, writer as WriterId, config))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("writer thread panicked"))
            .sum()
    });
    (delta, len(set))
}

/// The sequential baseline consumes the streams one after another.
fn run_sequential(streams: &[OpStream], config: &DriverConfig) -> (i64, usize) {
    let total_budget: usize = write_budgets(streams, config.insert_chance).iter().sum();
    let store: Arc<MaskStore<i64>> = Arc::new(DurableStore::new(&[total_budget]));
    let mut set = SequentialSet::new(store, total_budget);

    let mut delta = 0_i64;
    for stream in streams {
        for (&control, &item) in stream.controls.iter().zip(&stream.items) {
            if control <= config.insert_chance {
                if set.insert(hash(item), item) {
                    delta += 1;
                }
            } else if control <= config.remove_bound {
                if set.remove(hash(item)) {
                    delta -= 1;
                }
            } else {
                set.contains(hash(item));
            }
        }
    }
    (delta, set.len())
}

fn run_variant(config: &DriverConfig, streams: &[OpStream]) -> (i64, usize) {
    let budgets = write_budgets(streams, config.insert_chance);
    match config.variant {
        Variant::Sequential => run_sequential(streams, config),
        Variant::Lock => {
            let store: Arc<MaskStore<i64>> = Arc::new(DurableStore::new(&budgets));
            let set = LockSet::new(store, &budgets);
            run_concurrent(&set, streams, config, LockSet::len)
        }
        Variant::MrLock => {
            let store: Arc<MaskStore<i64>> = Arc::new(DurableStore::new(&budgets));
            let set = MrLockSet::new(store, &budgets);
            run_concurrent(&set, streams, config, MrLockSet::len)
        }
        Variant::LinkFree => {
            let store: Arc<MaskStore<i64>> = Arc::new(DurableStore::new(&budgets));
            let set = LinkFreeSet::new(store, &budgets);
            run_concurrent(&set, streams, config, LinkFreeSet::len)
        }
        Variant::Soft => {
            let store: Arc<SoftStore<i64>> = Arc::new(DurableStore::new(&budgets));
            let set = SoftSet::new(store, &budgets);
            run_concurrent(&set, streams, config, SoftSet::len)
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let streams = generate_streams(config.num_ops);

    let start = Instant::now();
    let (delta, size) = run_variant(&config, &streams);
    let elapsed = start.elapsed();

    println!(
        "Computational runtime was {} milliseconds",
        elapsed.as_millis()
    );
    println!(
        "Total of {NUM_THREADS} threads running {} operations each against the {} set",
        config.num_ops,
        config.variant.name()
    );
    println!("Total delta: {delta} should equal the size of the set");
    println!("Set size: {size}");

    if delta == size as i64 {
        ExitCode::SUCCESS
    } else {
        eprintln!("delta/size mismatch");
        ExitCode::FAILURE
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "fail fast in tests")]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn accepts_valid_arguments() {
        let config = parse_args(&args(&["100", "5", "3"])).unwrap();
        assert_eq!(config.num_ops, 100);
        assert_eq!(config.insert_chance, 5);
        assert_eq!(config.remove_bound, 8);
        assert_eq!(config.variant, Variant::MrLock);
    }

    #[test]
    fn accepts_variant_argument() {
        let config = parse_args(&args(&["100", "5", "3", "soft"])).unwrap();
        assert_eq!(config.variant, Variant::Soft);
        assert!(parse_args(&args(&["100", "5", "3", "btree"])).is_err());
    }

    #[test]
    fn rejects_out_of_range_arguments() {
        assert!(parse_args(&args(&["4", "5", "3"])).is_err());
        assert!(parse_args(&args(&["150001", "5", "3"])).is_err());
        assert!(parse_args(&args(&["100", "2", "3"])).is_err());
        assert!(parse_args(&args(&["100", "11", "0"])).is_err());
        assert!(parse_args(&args(&["100", "5", "7"])).is_err());
        assert!(parse_args(&args(&["100", "7", "4"])).is_err());
        assert!(parse_args(&args(&["100", "-5", "3"])).is_err());
        assert!(parse_args(&args(&["100", "x", "3"])).is_err());
        assert!(parse_args(&args(&["100", "5"])).is_err());
    }

    #[test]
    fn budgets_count_insert_decisions() {
        let streams = vec![
            OpStream {
                controls: vec![1, 5, 6, 10],
                items: vec![0; 4],
            },
            OpStream {
                controls: vec![7, 8, 9, 10],
                items: vec![0; 4],
            },
        ];
        assert_eq!(write_budgets(&streams, 5), vec![2, 0]);
    }

    #[test]
    fn small_workload_balances_on_every_variant() {
        for variant in [
            Variant::Sequential,
            Variant::Lock,
            Variant::MrLock,
            Variant::LinkFree,
            Variant::Soft,
        ] {
            // Small enough that the MRLock variant stays inside the 30-bit
            // resource cycle (4 threads x 6 inserts at most).
            let config = DriverConfig {
                num_ops: 6,
                insert_chance: 5,
                remove_bound: 8,
                variant,
            };
            let streams = generate_streams(config.num_ops);
            let (delta, size) = run_variant(&config, &streams);
            assert_eq!(delta, size as i64, "variant {}", variant.name());
        }
    }
}
