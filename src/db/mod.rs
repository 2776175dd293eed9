pub mod jobs;

pub use jobs::{
    JobListFilter, JobMutation, JobRecord, JobStatus, JobStore, JobUpdateOutcome, JobsRepoError,
    NewJob, NewOutputArtifact, OutputArtifact,
};
