use std::collections::HashMap;

/**
 * \brief 设置问题相关错误。
 */
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{vendor}: required setting '{question}' is missing (set {env_name})")]
    Missing {
        vendor: String,
        question: String,
        env_name: String,
    },
}

/**
 * \brief 将显示名称转为环境变量片段，如 "API key" -> "API_KEY"。
 */
pub fn build_env_variable(name: &str) -> String {
    name.trim()
        .to_ascii_uppercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/**
 * \brief 由 Vendor 名称生成环境变量前缀，如 "Poe" -> "POE_"；空名称返回空串。
 */
pub fn build_env_variable_prefix(name: &str) -> String {
    let base = build_env_variable(name);
    if base.is_empty() {
        base
    } else {
        format!("{}_", base)
    }
}

/**
 * \brief 配置来源：持久化设置叠加进程环境变量，键为环境变量名。
 */
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /**
     * \brief 用当前进程环境变量覆盖同名设置（环境变量优先）。
     */
    pub fn overlay_env(mut self) -> Self {
        self.values.extend(std::env::vars());
        self
    }
}

/**
 * \brief 单个设置问题，例如 "API key"。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupQuestion {
    pub label: String,
    /** \brief 对应环境变量名，如 POE_API_KEY */
    pub env_name: String,
    pub required: bool,
    pub default: Option<String>,
    /** \brief 当前取值；空串表示未配置 */
    pub value: String,
}

/** \brief 设置问题句柄，由 `Configurable::add_setup_question` 返回。 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionId(usize);

/**
 * \brief 可配置组件：持有标签、环境变量前缀及其设置问题。
 */
#[derive(Debug, Clone)]
pub struct Configurable {
    pub label: String,
    pub env_name_prefix: String,
    questions: Vec<SetupQuestion>,
}

impl Configurable {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            env_name_prefix: build_env_variable_prefix(label),
            questions: Vec::new(),
        }
    }

    pub fn add_setup_question(&mut self, label: &str, required: bool) -> QuestionId {
        self.push_question(label, required, None)
    }

    pub fn add_setup_question_with_default(
        &mut self,
        label: &str,
        required: bool,
        default: &str,
    ) -> QuestionId {
        self.push_question(label, required, Some(default.to_string()))
    }

    fn push_question(&mut self, label: &str, required: bool, default: Option<String>) -> QuestionId {
        let env_name = format!("{}{}", self.env_name_prefix, build_env_variable(label));
        let value = default.clone().unwrap_or_default();
        self.questions.push(SetupQuestion {
            label: label.to_string(),
            env_name,
            required,
            default,
            value,
        });
        QuestionId(self.questions.len() - 1)
    }

    pub fn questions(&self) -> &[SetupQuestion] {
        &self.questions
    }

    pub fn question(&self, id: QuestionId) -> &SetupQuestion {
        &self.questions[id.0]
    }

    pub fn value(&self, id: QuestionId) -> &str {
        &self.questions[id.0].value
    }

    pub fn set_value(&mut self, id: QuestionId, value: impl Into<String>) {
        self.questions[id.0].value = value.into();
    }

    /**
     * \brief 从 settings 中回答全部问题；未提供的取默认值。
     * \details 先写入所有取值再检查必填项，失败时返回第一个缺失项。
     */
    pub fn configure(&mut self, settings: &Settings) -> Result<(), ConfigError> {
        for q in &mut self.questions {
            q.value = settings
                .get(&q.env_name)
                .map(str::to_string)
                .or_else(|| q.default.clone())
                .unwrap_or_default();
        }
        match self
            .questions
            .iter()
            .find(|q| q.required && q.value.is_empty())
        {
            Some(q) => Err(ConfigError::Missing {
                vendor: self.label.clone(),
                question: q.label.clone(),
                env_name: q.env_name.clone(),
            }),
            None => Ok(()),
        }
    }
}
