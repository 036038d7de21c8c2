use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{ConfigError, Settings};
use crate::vendor::{HasSetupQuestions, SupportsListModels, Vendor, VendorError};

/**
 * \brief 编排层持有的 Vendor 集合，按名称查找并汇总模型列表。
 */
#[derive(Default)]
pub struct VendorRegistry {
    vendors: Vec<Arc<dyn Vendor>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 注册 Vendor；先用 settings 回答其设置问题，未配置完整也会注册但会记录警告。
     */
    pub fn register<V>(&mut self, mut vendor: V, settings: &Settings)
    where
        V: Vendor + 'static,
    {
        match vendor.configure(settings) {
            Ok(()) => info!("vendor '{}' configured", vendor.name()),
            Err(e) => warn!("vendor '{}' not configured: {}", vendor.name(), e),
        }
        self.vendors.push(Arc::new(vendor));
    }

    /** \brief 按名称查找（忽略大小写）。 */
    pub fn get(&self, name: &str) -> Option<Arc<dyn Vendor>> {
        self.vendors
            .iter()
            .find(|v| v.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.vendors.iter().map(|v| v.name().to_string()).collect()
    }

    /** \brief 所有必填设置均已回答的 Vendor。 */
    pub fn configured(&self) -> Vec<Arc<dyn Vendor>> {
        self.vendors
            .iter()
            .filter(|v| v.is_configured())
            .cloned()
            .collect()
    }

    /**
     * \brief 汇总已配置 Vendor 的模型，返回 (vendor, model)；单个 Vendor 失败只记录不中断。
     */
    pub async fn list_all_models(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for vendor in self.configured() {
            match vendor.list_models().await {
                Ok(models) => {
                    out.extend(
                        models
                            .into_iter()
                            .map(|m| (vendor.name().to_string(), m)),
                    );
                }
                Err(e) => warn!("list models for '{}' failed: {}", vendor.name(), e),
            }
        }
        out
    }

    /**
     * \brief 查找已配置的 Vendor，未注册或未配置时返回说明性错误。
     */
    pub fn require(&self, name: &str) -> Result<Arc<dyn Vendor>, VendorError> {
        let vendor = self
            .get(name)
            .ok_or_else(|| VendorError::InvalidInput(format!("unknown vendor '{}'", name)))?;
        let unanswered = vendor
            .setup_questions()
            .iter()
            .find(|q| q.required && q.value.is_empty());
        if let Some(q) = unanswered {
            return Err(ConfigError::Missing {
                vendor: vendor.name().to_string(),
                question: q.label.clone(),
                env_name: q.env_name.clone(),
            }
            .into());
        }
        Ok(vendor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poe::PoeVendor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = VendorRegistry::new();
        registry.register(PoeVendor::new(), &Settings::from_pairs([("POE_API_KEY", "k")]));
        assert_eq!(registry.names(), vec!["Poe".to_string()]);
        assert!(registry.get("poe").is_some());
        assert!(registry.get("openai").is_none());
        assert_eq!(registry.configured().len(), 1);
        assert!(registry.require("POE").is_ok());
    }

    #[test]
    fn test_unconfigured_vendor_is_registered_but_not_required() {
        let mut registry = VendorRegistry::new();
        registry.register(PoeVendor::new(), &Settings::new());
        assert!(registry.get("Poe").is_some());
        assert!(registry.configured().is_empty());
        let err = registry.require("Poe").err().expect("not configured");
        match &err {
            VendorError::Config(ConfigError::Missing { vendor, env_name, .. }) => {
                assert_eq!(vendor, "Poe");
                assert_eq!(env_name, "POE_API_KEY");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("missing"));
        assert!(matches!(
            registry.require("openai"),
            Err(VendorError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_list_all_models_skips_unconfigured() {
        let mut registry = VendorRegistry::new();
        registry.register(PoeVendor::new(), &Settings::new());
        assert!(registry.list_all_models().await.is_empty());
    }

    async fn mount_models(server: &MockServer, status: u16, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/ListModels"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    fn proxy_settings(server: &MockServer) -> Settings {
        Settings::from_pairs([
            ("POE_API_KEY", "k".to_string()),
            ("POE_BASE_URL", server.uri()),
        ])
    }

    #[tokio::test]
    async fn test_list_all_models_pairs_and_skips_failing_vendor() {
        let healthy = MockServer::start().await;
        mount_models(&healthy, 200, serde_json::json!(["a", "b"])).await;
        let broken = MockServer::start().await;
        mount_models(&broken, 500, serde_json::json!({"detail": "down"})).await;

        let mut registry = VendorRegistry::new();
        registry.register(PoeVendor::new(), &proxy_settings(&healthy));
        registry.register(PoeVendor::new(), &proxy_settings(&broken));
        assert_eq!(registry.configured().len(), 2);

        assert_eq!(
            registry.list_all_models().await,
            vec![
                ("Poe".to_string(), "a".to_string()),
                ("Poe".to_string(), "b".to_string()),
            ]
        );
        assert_eq!(broken.received_requests().await.map(|r| r.len()), Some(1));
    }
}
