mod binding;
mod provisioning;
mod reclaim;
mod support;
