use refcycle::logging::{self, debug, error, info};
use refcycle::{FinalizerContext, FinalizerError, GcConfig, Heap, ObjectId, ObjectSpec, Value};
use std::path::PathBuf;

/// Retained objects printed after a collection
const GARBAGE_PREVIEW: usize = 10;

#[derive(Debug)]
struct Config {
    cycles: usize,
    save_all: bool,
    break_cycles: bool,
    weakref_demo: bool,
    no_auto: bool,
    json: bool,
    config_path: Option<PathBuf>,
}

impl Config {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        let prog = args.first().map(String::as_str).unwrap_or("refcycle");

        let mut config = Self {
            cycles: 1,
            save_all: false,
            break_cycles: false,
            weakref_demo: false,
            no_auto: false,
            json: false,
            config_path: None,
        };

        let mut rest = args.iter().skip(1);
        while let Some(arg) = rest.next() {
            match arg.as_str() {
                "--help" | "-h" => return Err(Self::usage(prog)),
                "--cycles" => {
                    let value = rest.next().ok_or("--cycles requires a number")?;
                    config.cycles = value
                        .parse()
                        .map_err(|_| format!("Invalid cycle count: {}", value))?;
                }
                "--saveall" => config.save_all = true,
                "--break-cycles" => config.break_cycles = true,
                "--weakref-demo" => config.weakref_demo = true,
                "--no-auto" => config.no_auto = true,
                "--json" => config.json = true,
                "--config" => {
                    let path = rest.next().ok_or("--config requires a path")?;
                    config.config_path = Some(PathBuf::from(path));
                }
                opt => return Err(format!("Unknown option: {}\n\n{}", opt, Self::usage(prog))),
            }
        }

        Ok(config)
    }

    fn usage(prog: &str) -> String {
        format!(
            "refcycle - reference cycle collection demo\n\n\
            USAGE:\n    {} [OPTIONS]\n\n\
            OPTIONS:\n    \
            -h, --help          Print help information\n    \
            --cycles N          Number of two-node cycles to create (default 1)\n    \
            --saveall           Keep unreachable cycles in the garbage list\n    \
            --break-cycles      Break cycles before dropping them\n    \
            --weakref-demo      Show weak references going stale\n    \
            --no-auto           Disable threshold-triggered collection\n    \
            --json              Print the report and statistics as JSON\n    \
            --config PATH       Load collector settings from a TOML file\n\n\
            EXAMPLES:\n    \
            {} --cycles 3\n    \
            {} --cycles 2 --saveall",
            prog, prog, prog
        )
    }

    fn gc_config(&self) -> Result<GcConfig, Box<dyn std::error::Error>> {
        let mut gc = match &self.config_path {
            Some(path) => GcConfig::load(path)?,
            None => GcConfig::default(),
        };
        if self.save_all {
            gc.save_all = true;
        }
        if self.no_auto {
            gc.enabled = false;
        }
        Ok(gc)
    }
}

/// Finalizer announcing the node it belongs to
fn announce(ctx: &mut FinalizerContext<'_>) -> Result<(), FinalizerError> {
    println!("Deleting {}", ctx.label().unwrap_or("<unnamed>"));
    Ok(())
}

fn node(heap: &mut Heap, name: String) -> Result<ObjectId, refcycle::HeapError> {
    heap.allocate(ObjectSpec::labeled(name).finalizer(announce))
}

fn make_cycle_pair(heap: &mut Heap, i: usize) -> Result<(ObjectId, ObjectId), refcycle::HeapError> {
    let a = node(heap, format!("A{}", i))?;
    let b = node(heap, format!("B{}", i))?;
    heap.set_field(a, "other", b)?;
    heap.set_field(b, "other", a)?;
    Ok((a, b))
}

fn weakref_demo(heap: &mut Heap) -> Result<(), refcycle::HeapError> {
    let a = node(heap, "Weak-A".to_string())?;
    let b = node(heap, "Weak-B".to_string())?;
    let a_ref = heap.create_weak(a)?;
    let b_ref = heap.create_weak(b)?;

    // The locals go out of scope
    heap.drop_root(a)?;
    heap.drop_root(b)?;

    println!(
        "Weakrefs alive? A={} B={}",
        !heap.resolve_weak(a_ref)?.is_gone(),
        !heap.resolve_weak(b_ref)?.is_gone()
    );
    Ok(())
}

fn node_repr(heap: &Heap, id: ObjectId) -> String {
    heap.repr_with(id, |view| -> Result<String, String> {
        let name = view.label().ok_or("node has no name")?;
        let other = match view.field("other") {
            Some(Value::Ref(target)) => heap.label(*target).unwrap_or("?").to_string(),
            _ => "None".to_string(),
        };
        Ok(format!("Node(name='{}', other={})", name, other))
    })
}

fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut heap = Heap::with_config(config.gc_config()?)?;
    debug!(heap = ?heap, "Heap created");

    println!("Creating {} cycle(s)...", config.cycles);
    let mut holders = Vec::with_capacity(config.cycles);
    for i in 0..config.cycles {
        holders.push(make_cycle_pair(&mut heap, i)?);
    }

    if config.break_cycles {
        println!("Breaking cycles before collection...");
        for &(a, b) in &holders {
            heap.set_field(a, "other", Value::None)?;
            heap.set_field(b, "other", Value::None)?;
        }
    }

    println!("Dropping local references to cycles...");
    for (a, b) in holders.drain(..) {
        heap.drop_root(a)?;
        heap.drop_root(b)?;
    }

    if config.weakref_demo {
        println!("Running weakref demo...");
        weakref_demo(&mut heap)?;
    }

    println!("\nCollecting garbage...");
    let report = heap.collect(2)?;
    println!("GC collected {} unreachable objects.", report.collected());
    for failure in &report.finalizer_errors {
        eprintln!("  {}", failure);
    }

    let garbage = heap.garbage();
    if !garbage.is_empty() {
        println!("Uncollectable retained in garbage: {}", garbage.len());
        for (idx, &id) in garbage.iter().take(GARBAGE_PREVIEW).enumerate() {
            println!("  [{}] type=Node repr={}", idx + 1, node_repr(&heap, id));
        }
    }

    let stats = heap.stats();
    if config.json {
        let doc = serde_json::json!({ "report": report, "stats": stats });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("Generation stats:");
        for (generation, s) in stats.generations.iter().enumerate() {
            println!(
                "  Gen {}: collections={} collected={} uncollectable={}",
                generation, s.collections, s.collected, s.uncollectable
            );
        }
    }

    heap.publish_stats();
    Ok(())
}

fn main() {
    logging::init();

    let config = match Config::from_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    debug!(config = ?config, "Configuration loaded");

    if let Err(e) = run(&config) {
        error!(error = %e, "Demo failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    info!("Demo finished");
}
