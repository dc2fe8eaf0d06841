mod analysis_failures;
mod binding;
mod dependency_gating;
mod health;
mod shutdown;
mod storage;
mod unpack_locking;
