//! Public endpoints handed to consumers of PULL transfers.

use std::collections::HashMap;
use std::sync::Arc;

use ferry_core::{DataAddress, FlowError};

/// Where a consumer fetches data from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub endpoint: String,
    /// Address type of the data reference built around the endpoint.
    pub endpoint_type: String,
}

impl Endpoint {
    pub fn new(endpoint: impl Into<String>, endpoint_type: impl Into<String>) -> Self {
        Endpoint {
            endpoint: endpoint.into(),
            endpoint_type: endpoint_type.into(),
        }
    }
}

type GeneratorFn = Arc<dyn Fn(&DataAddress) -> Endpoint + Send + Sync>;
type ResponseGeneratorFn = Arc<dyn Fn() -> Endpoint + Send + Sync>;

/// Maps destination types (and response channel types) to endpoint
/// factories. Populated at startup.
#[derive(Default, Clone)]
pub struct PublicEndpointGenerator {
    generators: HashMap<String, GeneratorFn>,
    response_generators: HashMap<String, ResponseGeneratorFn>,
}

impl PublicEndpointGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_generator_function<F>(&mut self, destination_type: impl Into<String>, f: F)
    where
        F: Fn(&DataAddress) -> Endpoint + Send + Sync + 'static,
    {
        self.generators.insert(destination_type.into(), Arc::new(f));
    }

    pub fn add_response_generator_function<F>(&mut self, channel_type: impl Into<String>, f: F)
    where
        F: Fn() -> Endpoint + Send + Sync + 'static,
    {
        self.response_generators
            .insert(channel_type.into(), Arc::new(f));
    }

    pub fn generate_for(
        &self,
        destination_type: &str,
        source: &DataAddress,
    ) -> Result<Endpoint, FlowError> {
        self.generators
            .get(destination_type)
            .map(|f| f(source))
            .ok_or_else(|| {
                FlowError::Configuration(format!(
                    "no public endpoint generator for destination type '{destination_type}'"
                ))
            })
    }

    pub fn generate_response_for(&self, channel_type: &str) -> Result<Endpoint, FlowError> {
        self.response_generators
            .get(channel_type)
            .map(|f| f())
            .ok_or_else(|| {
                FlowError::Configuration(format!(
                    "no response channel generator for '{channel_type}'"
                ))
            })
    }

    pub fn supported_destination_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.generators.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for PublicEndpointGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicEndpointGenerator")
            .field("destination_types", &self.supported_destination_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_by_destination_type() {
        let mut generator = PublicEndpointGenerator::new();
        generator.add_generator_function("HttpData", |_| {
            Endpoint::new("http://localhost:8181/public", "HttpData")
        });
        generator.add_response_generator_function("HttpData", || {
            Endpoint::new("http://localhost:8181/response", "HttpData")
        });

        let endpoint = generator
            .generate_for("HttpData", &DataAddress::new("File"))
            .unwrap();
        assert_eq!(endpoint.endpoint, "http://localhost:8181/public");
        assert_eq!(
            generator.generate_response_for("HttpData").unwrap().endpoint,
            "http://localhost:8181/response"
        );
        assert_eq!(generator.supported_destination_types(), vec!["HttpData"]);
    }

    #[test]
    fn unknown_type_is_a_configuration_error() {
        let generator = PublicEndpointGenerator::new();
        assert!(matches!(
            generator.generate_for("Kafka", &DataAddress::new("File")),
            Err(FlowError::Configuration(_))
        ));
        assert!(generator.generate_response_for("Kafka").is_err());
    }
}
