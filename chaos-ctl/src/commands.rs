use std::path::Path;

use chaos_controller::{ExperimentStore, ImplRegistry, Inventory, RecordId, TargetResolver};
use chaos_core::capabilities::SystemCapabilities;
use chaos_core::util;
use console::style;
use log::info;

pub fn list_fault_kinds() {
    info!("Listing available fault kinds");
    println!("Available fault kinds:\n");

    for (kind, description) in ImplRegistry::builtin().kinds() {
        println!("  {:14} - {}", kind, description);
    }

    println!();
    println!("Set spec.fault.kind in the experiment manifest to select a kind");
}

fn mark(ok: bool) -> console::StyledObject<&'static str> {
    if ok {
        style("[✓]").green()
    } else {
        style("[✗]").red()
    }
}

/// Print host capabilities and validate the given files; false if any check failed
pub fn check_requirements(manifest: Option<&Path>, inventory: Option<&Path>) -> bool {
    info!("Checking fault injection requirements");
    println!("Checking fault injection requirements...\n");

    let caps = SystemCapabilities::detect();
    println!("{} Running as root", mark(caps.has_root));
    println!("{} CAP_SYS_ADMIN (setns)", mark(caps.has_sys_admin));
    println!("{} /proc/<pid>/ns available", mark(caps.has_proc_ns));
    println!("{} Host PID namespace", mark(caps.has_host_pid));
    println!("\nSystem info:");
    println!("  UID: {}", util::get_uid());
    println!("  {}", caps.summary());

    let mut ok = true;
    let registry = ImplRegistry::builtin();

    if let Some(path) = manifest {
        println!();
        match ExperimentStore::new(path)
            .load()
            .and_then(|exp| registry.build(&exp.spec.fault).map(|fault| (exp, fault)))
        {
            Ok((exp, fault)) => println!(
                "{} Experiment {} ({}{})",
                mark(true),
                exp.name,
                fault.kind(),
                if fault.one_shot() { ", one-shot" } else { "" }
            ),
            Err(e) => {
                ok = false;
                println!("{} {}: {}", mark(false), path.display(), e);
            }
        }
    }

    if let Some(path) = inventory {
        println!();
        match Inventory::load(path) {
            Ok(inv) => {
                let mut unresolved = 0;
                for pod in &inv.pods {
                    for container in &pod.containers {
                        let id = RecordId::new(&pod.namespace, &pod.name, &container.name);
                        if let Err(e) = inv.resolve(&id) {
                            unresolved += 1;
                            println!("{} {}: {}", mark(false), id, e);
                        }
                    }
                    if inv.daemon_address(&pod.node).is_none() {
                        unresolved += 1;
                        println!("{} node {} of {}/{} has no daemon address", mark(false), pod.node, pod.namespace, pod.name);
                    }
                }
                ok &= unresolved == 0;
                println!(
                    "{} Inventory: {} nodes, {} pods",
                    mark(unresolved == 0),
                    inv.nodes.len(),
                    inv.pods.len()
                );
            }
            Err(e) => {
                ok = false;
                println!("{} {}: {}", mark(false), path.display(), e);
            }
        }
    }

    ok
}
