//! Price lookups over the service catalog.
//!
//! Cars may combine several services and packages in `services`;
//! motorcycles pick services plus at most one `package`.

use crate::models::{Service, ServicePackage, VehicleSize};

/// Size-specific price, else the flat price, else 0.
pub fn service_price(service: &Service, size: VehicleSize) -> f64 {
    service
        .prices
        .as_ref()
        .and_then(|table| table.get(&size).copied())
        .or(service.price)
        .unwrap_or(0.0)
}

pub fn package_price(package: &ServicePackage, size: VehicleSize) -> f64 {
    package.prices.get(&size).copied().unwrap_or(0.0)
}

/// Read-only view of the catalog used for pricing and labels.
#[derive(Debug, Clone, Copy)]
pub struct Catalog<'a> {
    pub services: &'a [Service],
    pub packages: &'a [ServicePackage],
}

impl<'a> Catalog<'a> {
    pub fn new(services: &'a [Service], packages: &'a [ServicePackage]) -> Self {
        Self { services, packages }
    }

    pub fn service(&self, id: &str) -> Option<&'a Service> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn package(&self, id: &str) -> Option<&'a ServicePackage> {
        self.packages.iter().find(|p| p.id == id)
    }

    fn price_of(&self, id: &str, size: VehicleSize) -> f64 {
        if let Some(service) = self.service(id) {
            service_price(service, size)
        } else if let Some(package) = self.package(id) {
            package_price(package, size)
        } else {
            0.0
        }
    }

    /// Sum of the selected items at `size`. Unresolved ids count as 0.
    pub fn compute_total(
        &self,
        size: VehicleSize,
        service_ids: &[String],
        package: Option<&str>,
    ) -> f64 {
        let services: f64 = service_ids.iter().map(|id| self.price_of(id, size)).sum();
        let package = package
            .and_then(|id| self.package(id))
            .map(|p| package_price(p, size))
            .unwrap_or(0.0);
        services + package
    }

    /// Display label: names joined with " + ", unresolved ids skipped.
    pub fn label(&self, service_ids: &[String], package: Option<&str>) -> String {
        service_ids
            .iter()
            .map(String::as_str)
            .chain(package)
            .filter_map(|id| {
                self.service(id)
                    .map(|s| s.name.as_str())
                    .or_else(|| self.package(id).map(|p| p.name.as_str()))
            })
            .collect::<Vec<_>>()
            .join(" + ")
    }

    /// Packages attached to a vehicle, whether via `package` or mixed into
    /// a car's `services`.
    pub fn attached_packages(
        &self,
        service_ids: &[String],
        package: Option<&str>,
    ) -> Vec<&'a ServicePackage> {
        service_ids
            .iter()
            .map(String::as_str)
            .chain(package)
            .filter_map(|id| self.package(id))
            .collect()
    }

    /// Vehicles without a package need crew before work starts. Packages
    /// are self-service unless flagged `requiresCrew`.
    pub fn requires_crew(&self, service_ids: &[String], package: Option<&str>) -> bool {
        let packages = self.attached_packages(service_ids, package);
        // A package id that no longer resolves still counts as a package.
        let has_unresolved_package = package.is_some_and(|id| self.package(id).is_none());
        if packages.is_empty() && !has_unresolved_package {
            return true;
        }
        packages.iter().any(|p| p.requires_crew == Some(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriceTable, VehicleKind};

    fn wash() -> Service {
        Service {
            id: "svc-wash".into(),
            name: "Wash".into(),
            price: Some(200.0),
            prices: None,
            vehicle_type: VehicleKind::Car,
            is_deleted: false,
        }
    }

    fn wax() -> Service {
        let mut prices = PriceTable::new();
        prices.insert(VehicleSize::Medium, 300.0);
        prices.insert(VehicleSize::Large, 400.0);
        Service {
            id: "svc-wax".into(),
            name: "Wax".into(),
            price: Some(250.0),
            prices: Some(prices),
            vehicle_type: VehicleKind::Car,
            is_deleted: false,
        }
    }

    fn premium(requires_crew: Option<bool>) -> ServicePackage {
        let mut prices = PriceTable::new();
        prices.insert(VehicleSize::Medium, 500.0);
        ServicePackage {
            id: "pkg-premium".into(),
            name: "Premium".into(),
            prices,
            vehicle_type: VehicleKind::Car,
            is_active: true,
            is_deleted: false,
            requires_crew,
        }
    }

    #[test]
    fn test_flat_price_when_no_size_table() {
        assert_eq!(service_price(&wash(), VehicleSize::Small), 200.0);
    }

    #[test]
    fn test_size_table_wins_over_flat_price() {
        assert_eq!(service_price(&wax(), VehicleSize::Large), 400.0);
        assert_eq!(service_price(&wax(), VehicleSize::Small), 250.0);
    }

    #[test]
    fn test_total_sums_services_and_packages() {
        let services = [wash(), wax()];
        let packages = [premium(None)];
        let catalog = Catalog::new(&services, &packages);
        let ids = vec![
            "svc-wash".to_string(),
            "svc-wax".to_string(),
            "pkg-premium".to_string(),
            "missing".to_string(),
        ];
        assert_eq!(catalog.compute_total(VehicleSize::Medium, &ids, None), 1000.0);
        assert_eq!(
            catalog.compute_total(VehicleSize::Medium, &[], Some("pkg-premium")),
            500.0
        );
    }

    #[test]
    fn test_label_joins_names() {
        let services = [wash(), wax()];
        let packages = [premium(None)];
        let catalog = Catalog::new(&services, &packages);
        let ids = vec!["svc-wash".to_string(), "gone".to_string()];
        assert_eq!(catalog.label(&ids, Some("pkg-premium")), "Wash + Premium");
    }

    #[test]
    fn test_requires_crew() {
        let services = [wash()];
        let self_service = [premium(None)];
        let crewed = [premium(Some(true))];
        let ids = vec!["svc-wash".to_string()];

        assert!(Catalog::new(&services, &self_service).requires_crew(&ids, None));
        assert!(!Catalog::new(&services, &self_service).requires_crew(&ids, Some("pkg-premium")));
        assert!(Catalog::new(&services, &crewed).requires_crew(&ids, Some("pkg-premium")));
        assert!(!Catalog::new(&services, &[]).requires_crew(&ids, Some("old-package")));
    }
}
