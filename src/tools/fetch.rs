//! Fetch tool: retrieves a URL and converts the HTML body to Markdown.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::Error;
use crate::tool::{func, Parameters, Property, Tool};

const DESCRIPTION: &str = "
- Fetches the URL content, converting HTML to markdown
- Use this tool when you need to retrieve and analyze the latest web content
";

#[derive(Debug, Deserialize)]
struct In {
    url: String,
}

#[derive(Debug, Serialize)]
struct Out {
    status: u16,
    content: String,
}

/// Create the fetch tool using the given HTTP client.
pub fn new(http: reqwest::Client) -> Arc<dyn Tool> {
    let parameters = Parameters::new().property(
        "url",
        Property::string()
            .description("The URL to fetch content from")
            .required(),
    );

    func("fetch", DESCRIPTION, parameters, move |input: In| {
        let http = http.clone();
        async move {
            let response = http.get(&input.url).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;

            let content = htmd::convert(&body).map_err(|err| Error::Tool {
                tool: "fetch".to_string(),
                message: format!("converting HTML to markdown: {err}"),
            })?;

            Ok(Out { status, content })
        }
    })
}
