// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! RabbitMQ messaging runtime: publishing, request-reply over queues, and
//! supervised consumption of queues by processors.

pub mod api_manager;
pub mod builder;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod errors;
pub mod manager;
pub mod message;
pub mod otel;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod serializer;

pub use inventory;
