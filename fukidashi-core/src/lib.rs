pub mod hf_hub;
