//! # Execution Command Table
//!
//! The argv for the numerical executable is chosen by a lookup keyed on `(omp, mpi)`:
//!
//! | omp | mpi | argv |
//! |-----|-----|------|
//! | false | false | `exe file latMin latMax lonMin lonMax outDir nThreads` |
//! | true | false | `exe file latMin latMax lonMin lonMax outDir nThreads` |
//! | false | true | `mpirun -n nProcesses exe file latMin latMax lonMin lonMax outDir 1` |
//! | true | true | `mpirun -n nProcesses exe file latMin latMax lonMin lonMax outDir nThreads` |

use super::request::AreaBounds;

/// How the executable is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launcher {
    Direct,
    Mpirun,
}

/// What goes in the trailing thread-count slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSlot {
    Configured,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTemplate {
    pub launcher: Launcher,
    pub threads: ThreadSlot,
}

const COMMAND_TABLE: [((bool, bool), CommandTemplate); 4] = [
    (
        (false, false),
        CommandTemplate {
            launcher: Launcher::Direct,
            threads: ThreadSlot::Configured,
        },
    ),
    (
        (true, false),
        CommandTemplate {
            launcher: Launcher::Direct,
            threads: ThreadSlot::Configured,
        },
    ),
    (
        (false, true),
        CommandTemplate {
            launcher: Launcher::Mpirun,
            threads: ThreadSlot::Single,
        },
    ),
    (
        (true, true),
        CommandTemplate {
            launcher: Launcher::Mpirun,
            threads: ThreadSlot::Configured,
        },
    ),
];

/// Template for a flag combination
pub fn template_for(omp: bool, mpi: bool) -> CommandTemplate {
    COMMAND_TABLE
        .iter()
        .find(|(key, _)| *key == (omp, mpi))
        .map(|(_, template)| *template)
        .unwrap_or(CommandTemplate {
            launcher: Launcher::Direct,
            threads: ThreadSlot::Configured,
        })
}

/// Inputs to one execution command
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub executable: &'a str,
    pub source_file: &'a str,
    pub area: AreaBounds,
    pub out_dir: &'a str,
    pub omp: bool,
    pub mpi: bool,
    pub n_threads: u32,
    pub n_processes: u32,
}

/// Build the full argv, program first
pub fn build_argv(spec: &CommandSpec<'_>) -> Vec<String> {
    let template = template_for(spec.omp, spec.mpi);
    let [lat_min, lat_max] = spec.area.lat_range();
    let [lon_min, lon_max] = spec.area.lon_range();

    let mut argv = Vec::with_capacity(11);
    if template.launcher == Launcher::Mpirun {
        argv.push("mpirun".to_string());
        argv.push("-n".to_string());
        argv.push(spec.n_processes.to_string());
    }
    argv.extend([
        spec.executable.to_string(),
        spec.source_file.to_string(),
        lat_min.to_string(),
        lat_max.to_string(),
        lon_min.to_string(),
        lon_max.to_string(),
        spec.out_dir.to_string(),
    ]);
    argv.push(match template.threads {
        ThreadSlot::Configured => spec.n_threads.to_string(),
        ThreadSlot::Single => "1".to_string(),
    });
    argv
}
