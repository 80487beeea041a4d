use rtsched::{
    logs_match, ClassDef, EventLog, ExecResult, Location, ObjectRef, PolicyKind, System, SystemBuilder,
    ThreadScope, Value,
};

fn main() {
    println!("═══════════════════════════════════════════════════════");
    println!("  rtsched — Real-Time Resource Scheduler");
    println!("  Two CPUs, one bus: reset + replay verification demo");
    println!("═══════════════════════════════════════════════════════");
    println!();

    let system = match build() {
        Ok(system) => system,
        Err(e) => {
            eprintln!("  ✗ setup failed: {}", e);
            std::process::exit(1);
        }
    };

    // ── Run 1 ─────────────────────────────────────────────────
    let hash_1 = run(&system, "Run 1");

    // ── Run 2: same system after reset ────────────────────────
    system.reset();
    let hash_2 = run(&system, "Run 2");

    // ── Verify ────────────────────────────────────────────────
    println!("  Verification:");
    println!("    Run 1 log hash: {:016x}", hash_1);
    println!("    Run 2 log hash: {:016x}", hash_2);
    if hash_1 == hash_2 {
        println!("    ✓ Logs are IDENTICAL — deterministic replay confirmed.");
    } else {
        println!("    ✗ MISMATCH — determinism violation detected!");
    }
    // ── Optional: write the replay log and read it back ──────
    if let (Some(path), Some(log)) = (std::env::args().nth(1), system.event_log()) {
        match log
            .export_to_file(&path)
            .and_then(|()| EventLog::import_from_file(&path))
        {
            Ok(copy) if logs_match(log, &copy) => {
                println!("    ✓ Log written to {} and re-read intact.", path)
            }
            Ok(_) => println!("    ✗ Log re-read from {} differs!", path),
            Err(e) => println!("    ✗ Could not export log to {}: {}", path, e),
        }
    }
    println!();
    println!("  Final status:");
    for line in system.status().lines() {
        println!("    {}", line);
    }
}

fn build() -> rtsched::SchedResult<System> {
    let sensor = ClassDef::new("Sensor").operation("read", |scope, args| {
        scope.step(Location::new("Sensor`read", 1))?;
        let channel = args.first().and_then(Value::as_int).unwrap_or(0);
        scope.step(Location::new("Sensor`read", 2))?;
        Ok(Value::Int(100 + channel))
    });
    let controller = ClassDef::new("Controller").operation("poll", |scope, _| {
        let mut total = 0;
        for channel in 0..4 {
            scope.step(Location::new("Controller`poll", 1))?;
            let reading = scope.call(ObjectRef::new(2), "read", vec![Value::Int(channel)])?;
            total += reading.as_int().unwrap_or(0);
        }
        Ok(Value::Int(total))
    });

    SystemBuilder::new()
        .cpu("cpu1", 1_000_000, PolicyKind::Fcfs)
        .cpu("cpu2", 2_000_000, PolicyKind::FixedPriority)
        .bus("bus1", 64_000, &["cpu1", "cpu2"])
        .priority("cpu2", "Sensor`read", 3)
        .jitter(1, 42)
        .class(controller)
        .class(sensor)
        .object("Controller", "cpu1")
        .object("Sensor", "cpu2")
        .build()
}

fn poll(scope: &ThreadScope) -> ExecResult<Value> {
    scope.call(ObjectRef::new(1), "poll", vec![])
}

fn run(system: &System, label: &str) -> u64 {
    let result = system.run_main(poll);
    let Some(log) = system.event_log() else {
        return 0;
    };

    match result {
        Ok(value) => println!(
            "  {}: result {} at T={}, {} records",
            label,
            value,
            system.now(),
            log.len()
        ),
        Err(e) => println!("  {}: {} ({} records)", label, e, log.len()),
    }
    for record in log.named("ThreadSwapIn").iter().take(4) {
        println!("    {}", record);
    }

    log.log_hash()
}
