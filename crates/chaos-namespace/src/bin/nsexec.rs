//! chaos-nsexec: join the namespaces of another process, then exec a command

use chaos_namespace::NsexecArgs;
use clap::Parser;

fn main() {
    let args = NsexecArgs::parse();
    std::process::exit(chaos_namespace::enter::run(&args));
}
