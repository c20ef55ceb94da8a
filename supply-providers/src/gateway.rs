//! HTTP backend talking to the provisioning gateway that fronts CVM, DVM, CMDB, pool, ITSM
//! and SOPS. Every endpoint answers with the same `{result, code, message, data}` envelope.

use crate::inventory::*;
use crate::{
    CmdbClient, CvmClient, DvmClient, ItsmClient, PoolClient, RemoteError, Result, SopsClient,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Deserialize)]
struct Envelope<T> {
    result: bool,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct OrderId {
    order_id: String,
}

pub struct GatewayClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Transient(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("POST {}: {}", path, e)))?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RemoteError::Transient(format!("POST {} -> {}", path, status)));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| RemoteError::Transient(format!("POST {} body: {}", path, e)))?;
        let env: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| RemoteError::Decode(format!("POST {}: {} ({})", path, e, status)))?;
        if !env.result {
            tracing::warn!(path, code = %env.code, "gateway rejected call: {}", env.message);
            return Err(RemoteError::from_code(&env.code, &env.message));
        }
        // void endpoints answer with `data: null`
        match env.data {
            Some(data) => Ok(data),
            None => serde_json::from_value(serde_json::Value::Null)
                .map_err(|_| RemoteError::Decode(format!("POST {}: missing data", path))),
        }
    }
}

#[async_trait]
impl CvmClient for GatewayClient {
    async fn list_zones(&self, region: &str, device_type: &str) -> Result<Vec<String>> {
        self.call(
            "/cvm/zones/list",
            &json!({"region": region, "device_type": device_type}),
        )
        .await
    }

    async fn zone_capacity(
        &self,
        region: &str,
        device_type: &str,
        zones: &[String],
    ) -> Result<Vec<ZoneCapacity>> {
        self.call(
            "/cvm/capacity",
            &json!({"region": region, "device_type": device_type, "zones": zones}),
        )
        .await
    }

    async fn list_subnets(&self, region: &str, zone: &str, vpc_id: &str) -> Result<Vec<Subnet>> {
        self.call(
            "/cvm/subnets/list",
            &json!({"region": region, "zone": zone, "vpc_id": vpc_id}),
        )
        .await
    }

    async fn create_order(&self, req: &CvmCreateRequest) -> Result<String> {
        let id: OrderId = self.call("/cvm/orders/create", req).await?;
        Ok(id.order_id)
    }

    async fn query_order(&self, order_id: &str) -> Result<RemoteOrder> {
        self.call("/cvm/orders/get", &json!({"order_id": order_id}))
            .await
    }

    async fn list_instances(&self, order_id: &str) -> Result<Vec<ProvisionedInstance>> {
        self.call("/cvm/orders/instances", &json!({"order_id": order_id}))
            .await
    }
}

#[async_trait]
impl DvmClient for GatewayClient {
    async fn list_clusters(&self) -> Result<Vec<DvmCluster>> {
        self.call("/dvm/clusters/list", &json!({})).await
    }

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<DvmHost>> {
        self.call("/dvm/hosts/list", filter).await
    }

    async fn create_order(&self, req: &DvmCreateRequest) -> Result<String> {
        let id: OrderId = self.call("/dvm/orders/create", req).await?;
        Ok(id.order_id)
    }

    async fn query_order(&self, order_id: &str) -> Result<RemoteOrder> {
        self.call("/dvm/orders/get", &json!({"order_id": order_id}))
            .await
    }

    async fn list_instances(&self, order_id: &str) -> Result<Vec<ProvisionedInstance>> {
        self.call("/dvm/orders/instances", &json!({"order_id": order_id}))
            .await
    }
}

#[async_trait]
impl CmdbClient for GatewayClient {
    async fn get_host_info_by_ip(&self, ips: &[String]) -> Result<Vec<HostInfo>> {
        self.call("/cmdb/hosts/by_ip", &json!({"ips": ips})).await
    }

    async fn get_host_info_by_asset(&self, asset_ids: &[String]) -> Result<Vec<HostInfo>> {
        self.call("/cmdb/hosts/by_asset", &json!({"asset_ids": asset_ids}))
            .await
    }

    async fn get_host_biz_ids(&self, asset_ids: &[String]) -> Result<Vec<HostBiz>> {
        self.call("/cmdb/hosts/biz", &json!({"asset_ids": asset_ids}))
            .await
    }

    async fn list_biz_host(&self, bk_biz_id: i64) -> Result<Vec<HostInfo>> {
        self.call("/cmdb/biz/hosts", &json!({"bk_biz_id": bk_biz_id}))
            .await
    }

    async fn list_pool_hosts(&self, filter: &PoolHostFilter) -> Result<Vec<HostInfo>> {
        self.call("/cmdb/pool/hosts", filter).await
    }

    async fn add_host(&self, hosts: &[ProvisionedInstance], bk_biz_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "/cmdb/hosts/add",
                &json!({"hosts": hosts, "bk_biz_id": bk_biz_id}),
            )
            .await?;
        Ok(())
    }

    async fn transfer_host(&self, asset_ids: &[String], from_biz: i64, to_biz: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "/cmdb/hosts/transfer",
                &json!({"asset_ids": asset_ids, "from_biz": from_biz, "to_biz": to_biz}),
            )
            .await?;
        Ok(())
    }

    async fn update_host_operator(&self, asset_ids: &[String], operator: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "/cmdb/hosts/operator",
                &json!({"asset_ids": asset_ids, "operator": operator}),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PoolClient for GatewayClient {
    async fn create_recall_order(&self, req: &RecallRequest) -> Result<String> {
        let id: OrderId = self.call("/pool/recall/create", req).await?;
        Ok(id.order_id)
    }

    async fn query_recall_order(&self, order_id: &str) -> Result<RemoteOrder> {
        self.call("/pool/recall/get", &json!({"order_id": order_id}))
            .await
    }

    async fn list_recalled_instances(&self, order_id: &str) -> Result<Vec<ProvisionedInstance>> {
        self.call("/pool/recall/instances", &json!({"order_id": order_id}))
            .await
    }
}

#[async_trait]
impl ItsmClient for GatewayClient {
    async fn get_ticket_results(&self, ticket_ids: &[String]) -> Result<Vec<TicketResult>> {
        if ticket_ids.len() > crate::ITSM_BATCH_LIMIT {
            return Err(RemoteError::Rejected {
                code: "TooManyTickets".to_string(),
                message: format!(
                    "{} ids, limit is {}",
                    ticket_ids.len(),
                    crate::ITSM_BATCH_LIMIT
                ),
            });
        }
        self.call("/itsm/tickets/results", &json!({"ticket_ids": ticket_ids}))
            .await
    }
}

#[async_trait]
impl SopsClient for GatewayClient {
    async fn create_task(&self, req: &CreateTask) -> Result<SopsTask> {
        self.call("/sops/tasks/create", req).await
    }

    async fn get_task_list(&self, bk_biz_id: i64, name: &str) -> Result<Vec<SopsTask>> {
        self.call(
            "/sops/tasks/list",
            &json!({"bk_biz_id": bk_biz_id, "name": name}),
        )
        .await
    }

    async fn get_task_detail(&self, bk_biz_id: i64, task_id: &str) -> Result<TaskDetail> {
        self.call(
            "/sops/tasks/get",
            &json!({"bk_biz_id": bk_biz_id, "task_id": task_id}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_failure_is_classified() {
        let env: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{"result": false, "code": "ResourceInsufficient", "message": "no stock"}"#,
        )
        .unwrap();
        assert!(!env.result);
        assert!(RemoteError::from_code(&env.code, &env.message).is_capacity());
    }

    #[test]
    fn base_url_is_normalized() {
        let c = GatewayClient::new(" http://gw.local/api/ ", "t").unwrap();
        assert_eq!(c.base_url, "http://gw.local/api");
    }
}
