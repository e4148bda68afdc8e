// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Course enrollment: access control and progress for the course
//! marketplace.
//!
//! This crate provides the backend API that turns verified payments into
//! enrollments, answers "may this user view this course?", records lesson
//! progress, and repairs enrollment state left behind by older write paths.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod retry;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::CourseStore;
use retry::RetryPolicy;
use services::{
    AccessCache, AccessResolver, CheckoutFulfiller, EnrollmentWriter, FirebaseTokenVerifier,
    FunctionsClient, ProgressAggregator, Reconciler,
};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn CourseStore>,
    pub access: AccessResolver,
    pub enrollments: Arc<EnrollmentWriter>,
    pub progress: ProgressAggregator,
    pub checkout: CheckoutFulfiller,
    pub reconciler: Reconciler,
    pub functions: FunctionsClient,
    pub token_verifier: FirebaseTokenVerifier,
}

impl AppState {
    /// Wire every service around one store and one shared access cache.
    pub fn new(config: Config, store: Arc<dyn CourseStore>) -> anyhow::Result<Self> {
        let cache = Arc::new(AccessCache::new(
            config.access_cache_ttl,
            config.access_cache_capacity,
        ));
        let retry = RetryPolicy::from_config(&config);
        let timeout = config.store_timeout;

        let enrollments = Arc::new(EnrollmentWriter::new(
            store.clone(),
            cache.clone(),
            retry,
            timeout,
        ));

        Ok(Self {
            access: AccessResolver::new(store.clone(), cache.clone(), timeout),
            progress: ProgressAggregator::new(
                store.clone(),
                retry,
                timeout,
                config.default_time_zone,
            ),
            checkout: CheckoutFulfiller::new(store.clone(), enrollments.clone(), retry, timeout),
            reconciler: Reconciler::new(store.clone(), cache, retry, timeout),
            functions: FunctionsClient::new(&config)?,
            token_verifier: FirebaseTokenVerifier::new(&config)?,
            enrollments,
            store,
            config,
        })
    }
}
