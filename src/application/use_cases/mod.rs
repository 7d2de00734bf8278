pub mod answer_writer;
pub mod candidate_ranker;
pub mod catalog_seeder;
pub mod embedding_service;
pub mod execution_gate;
pub mod growth_monitor;
pub mod ivf_index;
pub mod parameter_binder;
pub mod prompt_builder;
pub mod query_pipeline;
pub mod safety_validator;
pub mod self_repair;
pub mod sql_generator;
pub mod sql_normalizer;
pub mod template_catalog;

#[cfg(test)]
pub mod test_support;
