//! Cross-module cases: synthetic images end to end through the container,
//! lifter, writers and the archive fan-out.

mod archive_cases;
mod container_cases;
mod lifter_cases;
