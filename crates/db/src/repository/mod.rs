//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types — pure SQL.
//!
//! Runs and steps are persisted through the `Store` trait
//! (`crate::store`/`crate::postgres_store`), not here — this module covers
//! what `Store` deliberately doesn't: resolving a workflow definition by id
//! (authoring and editing workflows isn't this service's job, but the
//! execution plane still needs to read one to start a run).

pub mod workflows;
