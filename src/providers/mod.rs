pub mod ndw;
pub mod nominatim;
pub mod osm;
